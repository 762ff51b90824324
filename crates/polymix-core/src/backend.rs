//! Output backends
//!
//! A backend owns the device callback and drives `Engine::mix` (or
//! `mix_signed16`) from it. The engine itself never touches a device, so
//! headless and offline rendering use the same pipeline through
//! `MockBackend`.

use std::sync::Arc;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::types::Sample;

/// An audio output driving the engine.
///
/// Not `Send` by requirement: some platform streams must stay on the
/// thread that created them.
pub trait Backend {
    fn name(&self) -> &str;

    /// Open the device and start pulling audio
    fn start(&mut self) -> EngineResult<()>;

    fn stop(&mut self);
}

/// Deviceless backend: the caller pulls blocks by hand.
///
/// Used by the test suite and for offline rendering.
pub struct MockBackend {
    engine: Arc<Engine>,
    buffer: Vec<Sample>,
    channels: usize,
}

impl MockBackend {
    pub fn new(engine: Arc<Engine>, frames: usize) -> Self {
        let channels = engine.channels();
        Self {
            engine,
            buffer: vec![0.0; frames * channels],
            channels,
        }
    }

    /// Mix one block and return it, interleaved
    pub fn render(&mut self) -> &[Sample] {
        self.engine.mix(&mut self.buffer);
        &self.buffer
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn start(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}
