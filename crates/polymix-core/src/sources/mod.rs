//! Built-in audio sources
//!
//! - `sample_buffer`: fully in-memory sample data, cheap to play many
//!   times at once
//! - `queue`: gapless back-to-back playback of pre-created streams
//! - `streaming`: background-decoded audio fed through a lock-free ring,
//!   for data too large or too slow to hold in memory

mod queue;
mod sample_buffer;
mod streaming;

pub use queue::QueueSource;
pub use sample_buffer::SampleBuffer;
pub use streaming::{BlockingReader, StreamingSource};
