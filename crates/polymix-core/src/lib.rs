//! Real-time software audio mixing engine
//!
//! A fixed table of up to 1024 voices is mixed down a bus tree into one
//! output stream. Every playing voice is addressed through a
//! generation-checked [`Handle`], so operations on finished voices are
//! harmless no-ops. Per quantum the engine triages voices by audibility
//! and fully mixes only the loudest few; the rest are silently advanced
//! or dropped according to their inaudible behavior.
//!
//! The mixer is pull-based and allocation-free in steady state: sources
//! hand out [`source::AudioStream`]s that are fetched in fixed
//! granularity blocks, filtered, resampled with a 16.16 fixed-point
//! cursor, panned into their bus, and finally soft-clipped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use polymix_core::{Engine, EngineConfig, SampleBuffer};
//!
//! let engine = Arc::new(Engine::new(&EngineConfig::default())?);
//! let beep = SampleBuffer::from_planar(vec![0.0; 44100], 44100.0, 1)?;
//! let handle = engine.play(&beep)?;
//! engine.fade_volume(handle, 0.0, 2.0);
//! engine.schedule_stop(handle, 2.0);
//! # Ok::<(), polymix_core::EngineError>(())
//! ```

pub mod backend;
pub(crate) mod buffer;
pub mod bus;
pub mod config;
#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
mod engine;
pub mod error;
pub mod fader;
pub mod filter;
pub mod handle;
pub(crate) mod resampler;
pub mod source;
pub mod sources;
pub mod types;
pub(crate) mod voice;

pub use backend::{Backend, MockBackend};
pub use bus::{Bus, BusViz};
pub use config::EngineConfig;
#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use fader::{Fader, FaderState};
pub use filter::{
    BiquadResonantFilter, BiquadType, EchoFilter, Filter, FilterInstance, SharedFilter,
    FILTER_ATTRIBUTE_WET,
};
pub use handle::Handle;
pub use source::{
    AudioAttenuator, AudioCollider, AudioSource, AudioStream, ListenerParams, Params3d,
    SeekFlags, SeekResult, SourceFlags, SourceParams, VoiceOutput,
};
pub use sources::{BlockingReader, QueueSource, SampleBuffer, StreamingSource};
pub use types::{
    AttenuationModel, ClipBehavior, ResampleMode, Sample, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_ACTIVE_VOICES, DEFAULT_SAMPLE_RATE, MAX_CHANNELS, VOICE_COUNT,
};
