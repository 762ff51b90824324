//! Live voice state
//!
//! A `Voice` is everything one `play()` needs while it runs: the pulled
//! output, mixing parameters with their faders, the fixed-point read
//! cursor, and bookkeeping for the resample buffer pool. Voices are
//! constructed outside the audio lock and installed into the engine's
//! voice table; stopping swaps the slot to `None` before the state is
//! dropped (deferred off the audio thread).

use std::f32::consts::PI;

use crate::fader::Fader;
use crate::filter::FilterInstance;
use crate::handle::Handle;
use crate::source::{SourceParams, VoiceOutput};
use crate::types::{FILTERS_PER_STREAM, INAUDIBLE_THRESHOLD, MAX_CHANNELS};

/// Runtime flags of a voice
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VoiceFlags {
    pub looping: bool,
    pub paused: bool,
    /// Never evicted by `find_free_voice`
    pub protected: bool,
    /// Overall volume is below the audibility threshold
    pub inaudible: bool,
    pub tick_when_inaudible: bool,
    pub kill_when_inaudible: bool,
    pub disable_autostop: bool,
    pub process_3d: bool,
}

/// State of one playing voice
pub(crate) struct Voice {
    pub output: VoiceOutput,
    pub source_id: u32,
    /// Global play counter value; the handle generation check
    pub play_index: u32,
    pub flags: VoiceFlags,
    pub channels: usize,
    pub base_sample_rate: f32,
    /// User-set speed multiplier
    pub set_relative_play_speed: f32,
    /// Set speed times doppler
    pub overall_relative_play_speed: f32,
    /// Doppler factor from the last 3D pass
    pub doppler: f32,
    /// Seconds of playback while unpaused, scaled by the overall play
    /// speed; drives faders
    pub stream_time: f64,
    /// Position within the source, seconds
    pub stream_position: f64,
    /// User-set volume
    pub set_volume: f32,
    /// Attenuated volume from the last 3D pass
    pub volume_3d: f32,
    /// `set_volume * volume_3d`; the triage sort key
    pub overall_volume: f32,
    pub pan: f32,
    /// Per-output-channel gain targets (pan law or 3D speaker volumes)
    pub channel_volume: [f32; MAX_CHANNELS],
    /// Gains actually applied last quantum; ramped toward the targets
    /// sample by sample so gain changes never click
    pub current_channel_volume: [f32; MAX_CHANNELS],
    pub volume_fader: Fader,
    pub pan_fader: Fader,
    pub relative_play_speed_fader: Fader,
    pub pause_scheduler: Fader,
    pub stop_scheduler: Fader,
    /// Set whenever a fader drove this voice during the current quantum
    pub active_fader: bool,
    /// 16.16 read cursor relative to the current resample block
    pub src_offset: i64,
    /// Valid frames in the current resample block
    pub block_frames: usize,
    /// Valid frames in the previous block (kernel lookback)
    pub prev_block_frames: usize,
    /// Output samples to skip before the voice starts sounding
    pub delay_samples: usize,
    pub loop_count: u32,
    /// Loop restart point, seconds
    pub loop_point: f64,
    /// Where this voice's output goes
    pub bus_handle: Handle,
    /// Index into the resample buffer pool, while mapped
    pub pool_slot: Option<usize>,
    pub filters: [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM],
}

impl Voice {
    pub fn new(output: VoiceOutput, source: &SourceParams, bus_handle: Handle) -> Self {
        let flags = VoiceFlags {
            looping: source.flags.looping,
            paused: false,
            protected: false,
            inaudible: false,
            tick_when_inaudible: source.flags.tick_when_inaudible,
            kill_when_inaudible: source.flags.kill_when_inaudible,
            disable_autostop: source.flags.disable_autostop,
            process_3d: source.flags.process_3d,
        };
        let mut voice = Self {
            output,
            source_id: source.id(),
            play_index: 0,
            flags,
            channels: source.channels.clamp(1, MAX_CHANNELS),
            base_sample_rate: source.base_sample_rate,
            set_relative_play_speed: 1.0,
            overall_relative_play_speed: 1.0,
            doppler: 1.0,
            stream_time: 0.0,
            stream_position: 0.0,
            set_volume: source.volume,
            volume_3d: 1.0,
            overall_volume: source.volume,
            pan: 0.0,
            channel_volume: [0.0; MAX_CHANNELS],
            current_channel_volume: [0.0; MAX_CHANNELS],
            volume_fader: Fader::new(),
            pan_fader: Fader::new(),
            relative_play_speed_fader: Fader::new(),
            pause_scheduler: Fader::new(),
            stop_scheduler: Fader::new(),
            active_fader: false,
            // Cursor starts exhausted so the first mix fetches a block
            src_offset: 0,
            block_frames: 0,
            prev_block_frames: 0,
            delay_samples: 0,
            loop_count: 0,
            loop_point: source.loop_point,
            bus_handle,
            pool_slot: None,
            filters: std::array::from_fn(|i| source.filters[i].as_ref().map(|f| f.create_instance())),
        };
        voice.set_pan(0.0);
        voice.recompute_volume();
        // New voices start at their target gain; there is nothing to ramp
        // from, and the signal onset masks the step anyway
        voice.seed_channel_ramp();
        voice
    }

    /// Constant-power pan: l = cos(theta), r = sin(theta) with
    /// theta = (pan + 1) * pi / 4, so center is ~0.707 on both sides.
    /// Wide layouts duplicate the front pair; center and sub stay full.
    pub fn set_pan(&mut self, pan: f32) {
        let pan = pan.clamp(-1.0, 1.0);
        self.pan = pan;
        let theta = (pan + 1.0) * PI / 4.0;
        let l = theta.cos();
        let r = theta.sin();
        self.channel_volume[0] = l;
        self.channel_volume[1] = r;
        self.channel_volume[2] = 1.0;
        self.channel_volume[3] = 1.0;
        self.channel_volume[4] = l;
        self.channel_volume[5] = r;
        self.channel_volume[6] = l;
        self.channel_volume[7] = r;
    }

    /// Set explicit per-side gains, bypassing the pan law
    pub fn set_pan_absolute(&mut self, left: f32, right: f32) {
        self.channel_volume[0] = left;
        self.channel_volume[1] = right;
        self.channel_volume[2] = 1.0;
        self.channel_volume[3] = 1.0;
        self.channel_volume[4] = left;
        self.channel_volume[5] = right;
        self.channel_volume[6] = left;
        self.channel_volume[7] = right;
    }

    /// Recompute the overall volume; returns true if audibility flipped
    /// (the active voice list must then be rebuilt)
    pub fn recompute_volume(&mut self) -> bool {
        self.overall_volume = self.set_volume * self.volume_3d;
        let inaudible = self.overall_volume.abs() < INAUDIBLE_THRESHOLD;
        let changed = inaudible != self.flags.inaudible;
        self.flags.inaudible = inaudible;
        changed
    }

    /// Snap the gain ramp to its target (used at voice start)
    pub fn seed_channel_ramp(&mut self) {
        for ch in 0..MAX_CHANNELS {
            self.current_channel_volume[ch] = self.channel_volume[ch] * self.overall_volume;
        }
    }

    /// Source frames consumed per output frame, before fixed-point scaling
    pub fn rate_ratio(&self, bus_sample_rate: f32) -> f32 {
        (self.base_sample_rate * self.overall_relative_play_speed) / bus_sample_rate
    }

    /// Reset block bookkeeping after a seek so the next mix refetches
    pub fn reset_blocks(&mut self) {
        self.src_offset = 0;
        self.block_frames = 0;
        self.prev_block_frames = 0;
    }
}
