//! Common types and constants for polymix
//!
//! Fixed-point layout, voice table sizing and the small shared enums used
//! throughout the engine.

use serde::{Deserialize, Serialize};

/// Audio sample type (32-bit float throughout the pipeline)
pub type Sample = f32;

/// Default output sample rate (Hz) when the backend does not report one
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default maximum mix quantum, in frames
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Maximum number of output channels supported by the pipeline (7.1)
pub const MAX_CHANNELS: usize = 8;

/// Total number of voice slots in the engine's voice table
pub const VOICE_COUNT: usize = 1024;

/// Default number of voices actually mixed per quantum
pub const DEFAULT_MAX_ACTIVE_VOICES: usize = 16;

/// Number of source frames fetched per voice read
pub const SAMPLE_GRANULARITY: usize = 512;

/// Filter slots per voice (and global filter slots on the engine)
pub const FILTERS_PER_STREAM: usize = 8;

/// Fractional bits of the 16.16 fixed-point resample cursor
pub const FIXPOINT_FRAC_BITS: u32 = 16;

/// 1.0 in 16.16 fixed point
pub const FIXPOINT_FRAC_MUL: i64 = 1 << FIXPOINT_FRAC_BITS;

/// Fractional mask of the 16.16 fixed-point cursor
pub const FIXPOINT_FRAC_MASK: i64 = FIXPOINT_FRAC_MUL - 1;

/// Default speed of sound for the 3D pass (m/s, dry air at 20C)
pub const DEFAULT_SOUND_SPEED: f32 = 343.0;

/// Voices with an overall volume below this are treated as inaudible
pub const INAUDIBLE_THRESHOLD: f32 = 0.001;

/// Resampling kernel used when a voice's rate differs from the bus rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMode {
    /// Nearest-sample (no interpolation) - fastest, aliases audibly
    Point,
    /// Linear interpolation (2-point) - fast, acceptable quality
    #[default]
    Linear,
    /// Catmull-Rom interpolation (4-point) - better quality
    CatmullRom,
}

impl ResampleMode {
    /// All kernels, in ascending quality order
    pub fn all() -> &'static [Self] {
        &[Self::Point, Self::Linear, Self::CatmullRom]
    }

    /// How many samples past the read position the kernel may touch
    pub(crate) fn lookahead(&self) -> usize {
        match self {
            Self::Point => 0,
            Self::Linear => 1,
            Self::CatmullRom => 2,
        }
    }
}

/// Output clipping applied after the master bus sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipBehavior {
    /// Hard clamp to [-1, 1]
    Hard,
    /// Cubic soft knee: gentle compression up to +-1.65, then flat
    #[default]
    SoftKnee,
}

/// Distance attenuation model for 3D voices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttenuationModel {
    /// No distance attenuation
    #[default]
    NoAttenuation,
    /// Inverse distance: min / (min + rolloff * (d - min))
    InverseDistance,
    /// Linear ramp: 1 - rolloff * (d - min) / (max - min)
    LinearDistance,
    /// Exponential: (d / min) ^ -rolloff
    ExponentialDistance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixpoint_constants() {
        assert_eq!(FIXPOINT_FRAC_MUL, 65536);
        assert_eq!(FIXPOINT_FRAC_MASK, 65535);
    }

    #[test]
    fn test_resample_mode_enumeration() {
        assert_eq!(ResampleMode::all().len(), 3);
        assert_eq!(ResampleMode::default(), ResampleMode::Linear);
        assert_eq!(ResampleMode::CatmullRom.lookahead(), 2);
    }
}
