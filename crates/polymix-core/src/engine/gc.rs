//! RT-safe deferred deallocation for voice state
//!
//! Voices can be dropped from inside the mix callback (natural end,
//! eviction, stop schedulers). Their state owns heap allocations - stream
//! boxes, filter instances - and freeing those on the audio thread risks
//! missing the deadline. Wrapping voices in `basedrop::Owned` makes the
//! audio-thread drop a pointer enqueue; the actual deallocation happens on
//! a background collector thread.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating `Owned<T>` allocations.
///
/// Initialized once; the Collector itself lives on a dedicated thread.
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("polymix-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created on its own thread
            let mut collector = Collector::new();

            let handle = collector.handle();
            tx.send(handle).expect("Failed to send GC handle");

            log::info!("voice GC thread started");

            loop {
                collector.collect();
                // 100ms is fast enough for memory reclamation
                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("Failed to spawn voice GC thread");

    rx.recv().expect("Failed to receive GC handle")
}

/// Get a handle for creating `Owned<T>` allocations
pub(crate) fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
