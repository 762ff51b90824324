//! Mixing busses
//!
//! A `Bus` is an `AudioSource` whose voice is a sub-mixer: the handle
//! returned by playing a bus becomes a routing target, and every voice
//! played with that handle as its bus is summed into the bus voice before
//! the bus itself is panned and expanded into its parent like any other
//! voice. Busses nest arbitrarily and carry their own filter slots.
//!
//! A bus voice never "ends" and is always ticked while inaudible, so
//! schedulers and faders of its children keep running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::AlignedFloatBuffer;
use crate::error::EngineResult;
use crate::handle::Handle;
use crate::source::{AudioSource, SourceParams, VoiceOutput};
use crate::types::{Sample, DEFAULT_SAMPLE_RATE, MAX_CHANNELS, SAMPLE_GRANULARITY};

/// Number of waveform samples kept for visualization
const WAVEFORM_SIZE: usize = 256;

/// Visualization data shared between the mixer and UI threads.
///
/// The audio thread only ever try-locks; a contended quantum skips the
/// update rather than blocking.
pub struct BusViz {
    peaks: Mutex<[f32; MAX_CHANNELS]>,
    waveform: Mutex<[f32; WAVEFORM_SIZE]>,
}

impl BusViz {
    fn new() -> Self {
        Self {
            peaks: Mutex::new([0.0; MAX_CHANNELS]),
            waveform: Mutex::new([0.0; WAVEFORM_SIZE]),
        }
    }

    /// Peak amplitude of one channel over the last mixed block
    pub fn channel_peak(&self, channel: usize) -> f32 {
        if channel >= MAX_CHANNELS {
            return 0.0;
        }
        self.peaks.lock()[channel]
    }

    /// Copy of the most recent mono waveform snapshot
    pub fn waveform(&self) -> [f32; WAVEFORM_SIZE] {
        *self.waveform.lock()
    }

    /// Called from the mixer after a bus block is produced
    pub(crate) fn accumulate(&self, block: &[Sample], frames: usize, stride: usize, channels: usize) {
        if let Some(mut peaks) = self.peaks.try_lock() {
            for (ch, peak) in peaks.iter_mut().enumerate().take(channels) {
                let row = &block[ch * stride..ch * stride + frames];
                *peak = row.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            }
        }
        if let Some(mut wave) = self.waveform.try_lock() {
            let n = frames.min(WAVEFORM_SIZE);
            for (i, w) in wave.iter_mut().enumerate().take(n) {
                let mut acc = 0.0;
                for ch in 0..channels {
                    acc += block[ch * stride + i];
                }
                *w = acc / channels.max(1) as f32;
            }
        }
    }
}

/// Per-play state of a bus voice
pub struct BusVoiceState {
    /// The bus voice's own handle; children route here. Assigned by the
    /// engine when the bus is played.
    pub(crate) channel: Handle,
    pub(crate) viz: Option<Arc<BusViz>>,
    /// Per-voice temp rows for the sub-mix, so bus recursion does not
    /// clobber the parent mixer's scratch
    pub(crate) scratch: AlignedFloatBuffer,
}

impl BusVoiceState {
    fn new(viz: Option<Arc<BusViz>>) -> Self {
        Self {
            channel: Handle::PRIMARY,
            viz,
            scratch: AlignedFloatBuffer::new(SAMPLE_GRANULARITY * MAX_CHANNELS),
        }
    }
}

/// A sub-mixing bus source
pub struct Bus {
    params: SourceParams,
    viz_enabled: AtomicBool,
    viz: Arc<BusViz>,
}

impl Bus {
    /// Stereo bus at the default rate
    pub fn new() -> Self {
        Self::with_channels(DEFAULT_SAMPLE_RATE as f32, 2)
    }

    pub fn with_channels(sample_rate: f32, channels: usize) -> Self {
        let mut params = SourceParams::new(sample_rate, channels.clamp(1, MAX_CHANNELS));
        // Children may carry schedulers and faders that must keep running
        // even when the bus output is silent
        params.flags.tick_when_inaudible = true;
        params.flags.disable_autostop = true;
        params.flags.single_instance = true;
        Self {
            params,
            viz_enabled: AtomicBool::new(false),
            viz: Arc::new(BusViz::new()),
        }
    }

    pub fn params_mut(&mut self) -> &mut SourceParams {
        &mut self.params
    }

    /// Enable or disable post-mix visualization capture
    pub fn set_visualization_enable(&self, enable: bool) {
        self.viz_enabled.store(enable, Ordering::Relaxed);
    }

    /// Visualization accessor; data is only refreshed while enabled
    pub fn visualization(&self) -> Arc<BusViz> {
        Arc::clone(&self.viz)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for Bus {
    fn params(&self) -> &SourceParams {
        &self.params
    }

    fn create_voice(&self) -> EngineResult<VoiceOutput> {
        let viz = self
            .viz_enabled
            .load(Ordering::Relaxed)
            .then(|| Arc::clone(&self.viz));
        Ok(VoiceOutput::Bus(BusVoiceState::new(viz)))
    }
}
