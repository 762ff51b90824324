//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{
    ClipBehavior, ResampleMode, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_ACTIVE_VOICES,
    DEFAULT_SAMPLE_RATE, MAX_CHANNELS, VOICE_COUNT,
};

/// Engine construction parameters.
///
/// Serializable so hosts can persist audio settings; `Default` gives the
/// stereo 44.1kHz configuration used by most callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Maximum frames per mix quantum (callers may mix less, never more)
    pub buffer_size: usize,
    /// Output channel count (1, 2, 4, 6 or 8)
    pub channels: usize,
    /// How many voices are actually mixed per quantum
    pub max_active_voices: usize,
    /// Resampling kernel for rate conversion
    pub resample_mode: ResampleMode,
    /// Output clip stage behavior
    pub clip_behavior: ClipBehavior,
    /// Gain applied after clipping, to leave headroom for DAC filters
    pub post_clip_scaler: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channels: 2,
            max_active_voices: DEFAULT_MAX_ACTIVE_VOICES,
            resample_mode: ResampleMode::default(),
            clip_behavior: ClipBehavior::default(),
            post_clip_scaler: 0.95,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration before engine construction
    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidParameter("sample_rate must be nonzero"));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::InvalidParameter("buffer_size must be nonzero"));
        }
        if !matches!(self.channels, 1 | 2 | 4 | 6 | 8) {
            return Err(EngineError::InvalidParameter(
                "channels must be 1, 2, 4, 6 or 8",
            ));
        }
        debug_assert!(self.channels <= MAX_CHANNELS);
        if self.max_active_voices == 0 || self.max_active_voices > VOICE_COUNT {
            return Err(EngineError::InvalidParameter(
                "max_active_voices out of range",
            ));
        }
        if !self.post_clip_scaler.is_finite() || self.post_clip_scaler < 0.0 {
            return Err(EngineError::InvalidParameter(
                "post_clip_scaler must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_odd_channel_counts() {
        let cfg = EngineConfig {
            channels: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
