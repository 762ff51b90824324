//! Background-decoded streaming source
//!
//! A dedicated feeder thread pulls interleaved frames from a
//! `BlockingReader` (file decoder, network stream, ...) and pushes them
//! into a lock-free SPSC ring. The playing voice pops from the ring on
//! the audio thread and pads silence on underrun instead of blocking.
//!
//! Seeks are asynchronous: requests go to a small global worker pool that
//! repositions the reader and invalidates everything already in flight by
//! publishing a discard watermark, so the consumer drops stale samples
//! without ever touching the reader itself. The feeder and the seek
//! workers share the reader through a `try_lock`; whoever loses just
//! retries on its next pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{EngineError, EngineResult};
use crate::source::{
    AudioSource, AudioStream, SeekFlags, SeekResult, SourceParams, VoiceOutput,
};
use crate::types::Sample;

/// Ring capacity in frames; about 190 ms at 44.1 kHz
const PREFETCH_FRAMES: usize = 8192;
/// Frames per decode call on the feeder thread
const DECODE_CHUNK: usize = 1024;
/// Feeder wakes at least this often even without a consumer nudge
const FEEDER_PARK: Duration = Duration::from_millis(50);

/// Number of threads servicing seek requests for all streams
const SEEK_WORKERS: usize = 2;

/// Blocking decode interface run entirely off the audio thread
pub trait BlockingReader: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> f32;

    /// Decode up to `frames` interleaved frames into `dst`; `Ok(0)` means
    /// end of stream
    fn read(&mut self, dst: &mut [Sample], frames: usize) -> EngineResult<usize>;

    /// Reposition to `frame`; returns the frame actually reached
    fn seek(&mut self, frame: u64) -> EngineResult<u64>;

    fn can_seek(&self) -> bool {
        true
    }
}

/// Reader plus its ring producer; feeder and seek workers contend for
/// this slot with `try_lock`
struct ReaderSlot {
    reader: Box<dyn BlockingReader>,
    producer: Producer<Sample>,
}

struct StreamShared {
    disposed: AtomicBool,
    /// Reader hit end of stream (cleared by a successful seek)
    exhausted: AtomicBool,
    /// Interleaved samples pushed into the ring since open
    pushed_total: AtomicU64,
    /// Consumer discards popped samples numbered below this
    discard_before: AtomicU64,
    slot: Mutex<ReaderSlot>,
    /// Parked here between plays; the voice takes it, its drop returns it
    consumer: Mutex<Option<Consumer<Sample>>>,
}

/// A streaming sound fed by a `BlockingReader`
pub struct StreamingSource {
    params: SourceParams,
    shared: Arc<StreamShared>,
    wake: Sender<()>,
    reader_can_seek: bool,
}

impl StreamingSource {
    pub fn new(reader: Box<dyn BlockingReader>) -> EngineResult<Self> {
        let channels = reader.channels();
        let sample_rate = reader.sample_rate();
        if channels == 0 || sample_rate <= 0.0 {
            return Err(EngineError::UnsupportedFormat(format!(
                "reader reports {channels} channels at {sample_rate} Hz"
            )));
        }
        let reader_can_seek = reader.can_seek();

        let (producer, consumer) = RingBuffer::new(PREFETCH_FRAMES * channels);
        let shared = Arc::new(StreamShared {
            disposed: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            pushed_total: AtomicU64::new(0),
            discard_before: AtomicU64::new(0),
            slot: Mutex::new(ReaderSlot { reader, producer }),
            consumer: Mutex::new(Some(consumer)),
        });

        let (wake, parked) = unbounded();
        spawn_feeder(Arc::clone(&shared), parked, channels)?;

        let mut params = SourceParams::new(sample_rate, channels);
        // One ring, one consumer
        params.flags.single_instance = true;
        Ok(Self {
            params,
            shared,
            wake,
            reader_can_seek,
        })
    }

    pub fn params_mut(&mut self) -> &mut SourceParams {
        &mut self.params
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }
}

impl AudioSource for StreamingSource {
    fn params(&self) -> &SourceParams {
        &self.params
    }

    fn create_voice(&self) -> EngineResult<VoiceOutput> {
        // The previous voice returns the consumer from the GC thread when
        // it is collected; until then the stream cannot restart
        let consumer = self.shared.consumer.lock().take().ok_or(EngineError::StreamError(
            "stream is already playing (or its last voice is still being reclaimed)".into(),
        ))?;
        Ok(VoiceOutput::Stream(Box::new(StreamVoice {
            shared: Arc::clone(&self.shared),
            consumer: Some(consumer),
            wake: self.wake.clone(),
            channels: self.params.channels,
            popped_total: 0,
            reader_can_seek: self.reader_can_seek,
        })))
    }
}

fn spawn_feeder(
    shared: Arc<StreamShared>,
    parked: Receiver<()>,
    channels: usize,
) -> EngineResult<()> {
    thread::Builder::new()
        .name("polymix-stream".to_string())
        .spawn(move || {
            let mut buf = vec![0.0f32; DECODE_CHUNK * channels];
            log::debug!("stream feeder started ({channels} channels)");
            loop {
                if shared.disposed.load(Ordering::Acquire) {
                    break;
                }
                if !shared.exhausted.load(Ordering::Acquire) {
                    if let Some(mut slot) = shared.slot.try_lock() {
                        fill_ring(&mut slot, &shared, &mut buf, channels);
                    }
                }
                // Park; pops on the audio side nudge us awake early
                let _ = parked.recv_timeout(FEEDER_PARK);
            }
            log::debug!("stream feeder stopped");
        })
        .map_err(|e| EngineError::StreamError(format!("failed to spawn feeder thread: {e}")))?;
    Ok(())
}

fn fill_ring(slot: &mut ReaderSlot, shared: &StreamShared, buf: &mut [Sample], channels: usize) {
    while slot.producer.slots() >= buf.len() {
        let frames = match slot.reader.read(buf, DECODE_CHUNK) {
            Ok(0) => {
                shared.exhausted.store(true, Ordering::Release);
                return;
            }
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("stream decode failed: {e}");
                shared.exhausted.store(true, Ordering::Release);
                return;
            }
        };
        for &s in &buf[..frames * channels] {
            if slot.producer.push(s).is_err() {
                // Cannot happen given the slots() check; drop the sample
                // rather than spin
                return;
            }
        }
        shared
            .pushed_total
            .fetch_add((frames * channels) as u64, Ordering::Release);
    }
}

struct StreamVoice {
    shared: Arc<StreamShared>,
    consumer: Option<Consumer<Sample>>,
    wake: Sender<()>,
    channels: usize,
    /// Interleaved samples popped since open; compared against the
    /// discard watermark
    popped_total: u64,
    reader_can_seek: bool,
}

impl Drop for StreamVoice {
    fn drop(&mut self) {
        // Runs on the GC thread; hand the consumer back for the next play
        if let Some(consumer) = self.consumer.take() {
            *self.shared.consumer.lock() = Some(consumer);
        }
    }
}

impl AudioStream for StreamVoice {
    fn get_audio(&mut self, dst: &mut [Sample], samples: usize, stride: usize) -> usize {
        let channels = self.channels;
        let discard = self.shared.discard_before.load(Ordering::Acquire);
        let mut frames = 0;
        if let Some(consumer) = self.consumer.as_mut() {
            'fill: while frames < samples {
                // Drop anything decoded before the last seek
                while self.popped_total < discard {
                    if consumer.pop().is_err() {
                        break 'fill;
                    }
                    self.popped_total += 1;
                }
                // Pop whole frames only; the feeder may be mid-frame
                if consumer.slots() < channels {
                    break;
                }
                for ch in 0..channels {
                    if let Ok(s) = consumer.pop() {
                        dst[ch * stride + frames] = s;
                        self.popped_total += 1;
                    }
                }
                frames += 1;
            }
        }
        let _ = self.wake.try_send(());

        if frames < samples {
            if self.shared.exhausted.load(Ordering::Acquire) {
                // True end of stream
                return frames;
            }
            // Underrun: pad silence and keep going rather than glitch the
            // voice lifecycle
            for ch in 0..channels {
                dst[ch * stride + frames..ch * stride + samples].fill(0.0);
            }
            return samples;
        }
        frames
    }

    fn has_ended(&self) -> bool {
        self.shared.exhausted.load(Ordering::Acquire)
            && self
                .consumer
                .as_ref()
                .map(Consumer::is_empty)
                .unwrap_or(true)
    }

    fn can_seek(&self) -> bool {
        self.reader_can_seek
    }

    fn seek(
        &mut self,
        position: u64,
        _scratch: &mut [Sample],
        flags: SeekFlags,
    ) -> EngineResult<SeekResult> {
        if !self.reader_can_seek {
            return Err(EngineError::NotImplemented("reader cannot seek"));
        }
        let (reply_tx, reply_rx) = if flags.blocking {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        seek_pool()
            .send(SeekRequest {
                shared: Arc::clone(&self.shared),
                target_frame: position,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::StreamError("seek pool is gone".into()))?;
        let _ = self.wake.try_send(());
        match reply_rx {
            Some(rx) => rx
                .recv()
                .map_err(|_| EngineError::StreamError("seek worker dropped the request".into()))?,
            // Async: report the target as an estimate; the watermark makes
            // the ring catch up
            None => Ok(SeekResult {
                position,
                end_of_stream: false,
            }),
        }
    }
}

struct SeekRequest {
    shared: Arc<StreamShared>,
    target_frame: u64,
    reply: Option<Sender<EngineResult<SeekResult>>>,
}

static SEEK_POOL: OnceLock<Sender<SeekRequest>> = OnceLock::new();

fn seek_pool() -> &'static Sender<SeekRequest> {
    SEEK_POOL.get_or_init(|| {
        let (tx, rx) = unbounded::<SeekRequest>();
        for i in 0..SEEK_WORKERS {
            let rx = rx.clone();
            let requeue = tx.clone();
            thread::Builder::new()
                .name(format!("polymix-seek-{i}"))
                .spawn(move || {
                    while let Ok(request) = rx.recv() {
                        service_seek(request, &requeue);
                    }
                })
                .expect("Failed to spawn seek worker");
        }
        tx
    })
}

fn service_seek(request: SeekRequest, requeue: &Sender<SeekRequest>) {
    if request.shared.disposed.load(Ordering::Acquire) {
        return;
    }
    let Some(mut slot) = request.shared.slot.try_lock() else {
        // Feeder holds the reader; come back after a decode chunk
        thread::sleep(Duration::from_millis(1));
        let _ = requeue.send(request);
        return;
    };
    let result = match slot.reader.seek(request.target_frame) {
        Ok(reached) => {
            // Everything pushed so far predates the seek; the lock keeps
            // the feeder from pushing while we set the watermark
            let pushed = request.shared.pushed_total.load(Ordering::Acquire);
            request
                .shared
                .discard_before
                .store(pushed, Ordering::Release);
            request.shared.exhausted.store(false, Ordering::Release);
            Ok(SeekResult {
                position: reached,
                end_of_stream: false,
            })
        }
        Err(e) => {
            log::warn!("stream seek to frame {} failed: {e}", request.target_frame);
            Err(e)
        }
    };
    drop(slot);
    if let Some(reply) = request.reply {
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader producing frame-numbered samples so position is observable
    struct CountingReader {
        cursor: u64,
        frames: u64,
        channels: usize,
    }

    impl BlockingReader for CountingReader {
        fn channels(&self) -> usize {
            self.channels
        }
        fn sample_rate(&self) -> f32 {
            44100.0
        }
        fn read(&mut self, dst: &mut [Sample], frames: usize) -> EngineResult<usize> {
            let n = frames.min((self.frames - self.cursor) as usize);
            for i in 0..n {
                for ch in 0..self.channels {
                    dst[i * self.channels + ch] = (self.cursor + i as u64) as f32;
                }
            }
            self.cursor += n as u64;
            Ok(n)
        }
        fn seek(&mut self, frame: u64) -> EngineResult<u64> {
            self.cursor = frame.min(self.frames);
            Ok(self.cursor)
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    fn voice_of(source: &StreamingSource) -> Box<dyn AudioStream> {
        match source.create_voice().unwrap() {
            VoiceOutput::Stream(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_prefetch_then_read() {
        let source = StreamingSource::new(Box::new(CountingReader {
            cursor: 0,
            frames: 4096,
            channels: 1,
        }))
        .unwrap();
        let shared = Arc::clone(&source.shared);
        wait_for(|| shared.pushed_total.load(Ordering::Acquire) >= 64);

        let mut voice = voice_of(&source);
        let mut dst = [0.0; 64];
        assert_eq!(voice.get_audio(&mut dst, 64, 64), 64);
        assert_eq!(dst[0], 0.0);
        assert_eq!(dst[63], 63.0);
    }

    #[test]
    fn test_exhausted_stream_ends_with_short_read() {
        // Once the reader is exhausted and the ring drains, a short read
        // signals the true end instead of padding silence
        let source = StreamingSource::new(Box::new(CountingReader {
            cursor: 0,
            frames: 16,
            channels: 1,
        }))
        .unwrap();
        let shared = Arc::clone(&source.shared);
        wait_for(|| shared.exhausted.load(Ordering::Acquire));

        let mut voice = voice_of(&source);
        let mut dst = [1.0; 32];
        // 16 real frames, then a short read because the reader is done
        assert_eq!(voice.get_audio(&mut dst, 32, 32), 16);
        assert!(voice.has_ended());
    }

    #[test]
    fn test_single_consumer_enforced() {
        let source = StreamingSource::new(Box::new(CountingReader {
            cursor: 0,
            frames: 1024,
            channels: 2,
        }))
        .unwrap();
        let _voice = voice_of(&source);
        assert!(source.create_voice().is_err());
    }

    #[test]
    fn test_consumer_returns_on_voice_drop() {
        let source = StreamingSource::new(Box::new(CountingReader {
            cursor: 0,
            frames: 1024,
            channels: 1,
        }))
        .unwrap();
        let voice = voice_of(&source);
        drop(voice);
        assert!(source.create_voice().is_ok());
    }

    #[test]
    fn test_async_seek_discards_prefetched_audio() {
        let source = StreamingSource::new(Box::new(CountingReader {
            cursor: 0,
            frames: 100_000,
            channels: 1,
        }))
        .unwrap();
        let shared = Arc::clone(&source.shared);
        wait_for(|| shared.pushed_total.load(Ordering::Acquire) >= 1024);

        let mut voice = voice_of(&source);
        let mut scratch = [0.0; 4];
        let r = voice
            .seek(
                50_000,
                &mut scratch,
                SeekFlags { blocking: true },
            )
            .unwrap();
        assert_eq!(r.position, 50_000);

        // The ring is still full of stale data; popping it off drains the
        // discard region and lets the feeder refill from the new position
        let mut dst = [0.0; 8];
        let mut got = 0;
        for _ in 0..200 {
            got = voice.get_audio(&mut dst, 8, 8);
            if dst[0] >= 50_000.0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got, 8);
        assert!(dst[0] >= 50_000.0, "still reading stale data: {}", dst[0]);
    }
}
