//! Audio source and stream capabilities
//!
//! An `AudioSource` is a playable definition (sample data, a streaming
//! decoder, a bus); each `play` asks it for a fresh `VoiceOutput`, either
//! a `Stream` pulled by the mixer or a `Bus` sub-mixer filled recursively.
//!
//! Sources are engine-affine: the first `play` binds the source to that
//! engine and playing it on another engine fails fast, since handles and
//! bus routing are only meaningful within one engine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::BusVoiceState;
use crate::error::{EngineError, EngineResult};
use crate::filter::Filter;
use crate::types::{AttenuationModel, Sample, FILTERS_PER_STREAM};

/// Position and orientation of the 3D listener
#[derive(Debug, Clone, Copy)]
pub struct ListenerParams {
    pub position: [f32; 3],
    /// Look-at direction
    pub at: [f32; 3],
    pub up: [f32; 3],
    pub velocity: [f32; 3],
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            at: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
            velocity: [0.0, 0.0, 0.0],
        }
    }
}

/// Custom volume shaping for 3D voices, e.g. zoned audio or occlusion
pub trait AudioCollider: Send + Sync {
    /// Return a volume factor in [0, 1] for a voice at `position`
    fn collide(&self, listener: &ListenerParams, position: [f32; 3], user_data: i32) -> f32;
}

/// Custom distance attenuation replacing the built-in models
pub trait AudioAttenuator: Send + Sync {
    fn attenuate(&self, distance: f32, min_distance: f32, max_distance: f32, rolloff: f32) -> f32;
}

/// 3D parameters shared by a source's voices
#[derive(Clone)]
pub struct Params3d {
    pub min_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub doppler_factor: f32,
    pub attenuation: AttenuationModel,
    pub collider: Option<Arc<dyn AudioCollider>>,
    pub collider_user_data: i32,
    pub attenuator: Option<Arc<dyn AudioAttenuator>>,
}

impl Default for Params3d {
    fn default() -> Self {
        Self {
            min_distance: 1.0,
            max_distance: 1_000_000.0,
            rolloff_factor: 1.0,
            doppler_factor: 1.0,
            attenuation: AttenuationModel::default(),
            collider: None,
            collider_user_data: 0,
            attenuator: None,
        }
    }
}

/// Behavioral flags copied onto each voice at play time
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceFlags {
    /// Restart from the loop point instead of ending
    pub looping: bool,
    /// Playing again stops the previous voice of this source first
    pub single_instance: bool,
    /// Keep the voice alive after the stream ends
    pub disable_autostop: bool,
    /// Voice participates in the 3D pass
    pub process_3d: bool,
    /// 3D coordinates are relative to the listener
    pub listener_relative: bool,
    /// Delay playback start by the distance to the listener
    pub distance_delay: bool,
    /// Keep advancing the stream while inaudible
    pub tick_when_inaudible: bool,
    /// Stop the voice once it becomes inaudible
    pub kill_when_inaudible: bool,
}

/// Outcome of a seek
#[derive(Debug, Clone, Copy)]
pub struct SeekResult {
    /// Frame position actually reached
    pub position: u64,
    /// The target was at or past the end of the stream
    pub end_of_stream: bool,
}

/// Seek options
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekFlags {
    /// Wait for the seek to complete (streaming sources only; never set
    /// this from the audio thread)
    pub blocking: bool,
}

/// Pull-based audio producer driving one voice.
///
/// Output is planar: channel `c` of a `get_audio` call occupies
/// `dst[c * stride .. c * stride + samples]`.
pub trait AudioStream: Send {
    /// Produce up to `samples` frames; returns the number produced.
    /// A short read means the stream ran out (or, for prefetched streams,
    /// confirmed exhaustion).
    fn get_audio(&mut self, dst: &mut [Sample], samples: usize, stride: usize) -> usize;

    /// Whether the stream has played to its end
    fn has_ended(&self) -> bool;

    /// Whether `seek` can reposition without reading forward
    fn can_seek(&self) -> bool {
        true
    }

    /// Move the read position to `position` (frames). `scratch` is
    /// engine-provided storage a drain-style seek may decode into.
    fn seek(
        &mut self,
        position: u64,
        scratch: &mut [Sample],
        flags: SeekFlags,
    ) -> EngineResult<SeekResult>;
}

/// Seek-by-reading fallback for decoders that can only move forward.
///
/// Reads and discards frames from `current` until `target`, reporting the
/// position reached and whether the stream ended first.
pub fn drain_seek(
    stream: &mut dyn AudioStream,
    current: u64,
    target: u64,
    channels: usize,
    scratch: &mut [Sample],
) -> EngineResult<SeekResult> {
    if target < current {
        return Err(EngineError::NotImplemented(
            "stream cannot seek backwards",
        ));
    }
    let chunk = (scratch.len() / channels.max(1)).max(1);
    let mut position = current;
    while position < target {
        let want = ((target - position) as usize).min(chunk);
        let got = stream.get_audio(scratch, want, chunk);
        position += got as u64;
        if got < want {
            return Ok(SeekResult {
                position,
                end_of_stream: true,
            });
        }
    }
    Ok(SeekResult {
        position,
        end_of_stream: false,
    })
}

/// The two things a voice can be: a pulled stream, or a sub-mixing bus
pub enum VoiceOutput {
    Stream(Box<dyn AudioStream>),
    Bus(BusVoiceState),
}

static NEXT_SOURCE_ID: AtomicU32 = AtomicU32::new(1);

/// Definition-level state shared by every source type
pub struct SourceParams {
    id: u32,
    /// Engine affinity: id of the engine this source first played on
    engine: AtomicU64,
    pub base_sample_rate: f32,
    pub channels: usize,
    /// Default voice volume when `play` does not override it
    pub volume: f32,
    pub flags: SourceFlags,
    /// Loop restart point, seconds
    pub loop_point: f64,
    pub filters: [Option<Arc<dyn Filter>>; FILTERS_PER_STREAM],
    pub spatial: Params3d,
}

impl SourceParams {
    pub fn new(base_sample_rate: f32, channels: usize) -> Self {
        Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            engine: AtomicU64::new(0),
            base_sample_rate,
            channels,
            volume: 1.0,
            flags: SourceFlags::default(),
            loop_point: 0.0,
            filters: std::array::from_fn(|_| None),
            spatial: Params3d::default(),
        }
    }

    /// Unique id of this source, stable for its lifetime
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Attach a filter to one of the per-voice filter slots
    pub fn set_filter(&mut self, slot: usize, filter: Option<Arc<dyn Filter>>) -> EngineResult<()> {
        if slot >= FILTERS_PER_STREAM {
            return Err(EngineError::InvalidParameter("filter slot out of range"));
        }
        self.filters[slot] = filter;
        Ok(())
    }

    /// Record (or verify) which engine this source belongs to
    pub(crate) fn bind_engine(&self, engine_id: u64) -> EngineResult<()> {
        match self
            .engine
            .compare_exchange(0, engine_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(bound) if bound == engine_id => Ok(()),
            Err(_) => Err(EngineError::InvalidParameter(
                "source already bound to a different engine",
            )),
        }
    }
}

/// A playable sound definition
pub trait AudioSource: Send + Sync {
    fn params(&self) -> &SourceParams;

    /// Create the per-play output. Called outside the audio lock; this is
    /// where allocation is allowed.
    fn create_voice(&self) -> EngineResult<VoiceOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountdownStream {
        remaining: usize,
    }

    impl AudioStream for CountdownStream {
        fn get_audio(&mut self, dst: &mut [Sample], samples: usize, _stride: usize) -> usize {
            let n = samples.min(self.remaining);
            dst[..n].fill(1.0);
            self.remaining -= n;
            n
        }

        fn has_ended(&self) -> bool {
            self.remaining == 0
        }

        fn can_seek(&self) -> bool {
            false
        }

        fn seek(
            &mut self,
            _position: u64,
            _scratch: &mut [Sample],
            _flags: SeekFlags,
        ) -> EngineResult<SeekResult> {
            Err(EngineError::NotImplemented("countdown stream"))
        }
    }

    #[test]
    fn test_drain_seek_reaches_target() {
        let mut stream = CountdownStream { remaining: 100 };
        let mut scratch = [0.0; 16];
        let result = drain_seek(&mut stream, 0, 40, 1, &mut scratch).unwrap();
        assert_eq!(result.position, 40);
        assert!(!result.end_of_stream);
        assert_eq!(stream.remaining, 60);
    }

    #[test]
    fn test_drain_seek_reports_end_of_stream() {
        let mut stream = CountdownStream { remaining: 10 };
        let mut scratch = [0.0; 16];
        let result = drain_seek(&mut stream, 0, 50, 1, &mut scratch).unwrap();
        assert_eq!(result.position, 10);
        assert!(result.end_of_stream);
    }

    #[test]
    fn test_drain_seek_rejects_backwards() {
        let mut stream = CountdownStream { remaining: 10 };
        let mut scratch = [0.0; 16];
        assert!(drain_seek(&mut stream, 20, 5, 1, &mut scratch).is_err());
    }

    #[test]
    fn test_engine_affinity_is_sticky() {
        let params = SourceParams::new(44100.0, 2);
        params.bind_engine(7).unwrap();
        params.bind_engine(7).unwrap();
        assert!(params.bind_engine(8).is_err());
    }

    #[test]
    fn test_source_ids_are_unique() {
        let a = SourceParams::new(44100.0, 1);
        let b = SourceParams::new(44100.0, 1);
        assert_ne!(a.id(), b.id());
    }
}
