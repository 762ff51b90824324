//! Audio filter capability and built-in filters
//!
//! A `Filter` is a shareable factory; each voice (or global filter slot)
//! gets its own `FilterInstance` with private state. Instances process
//! planar blocks in-place at the source's native rate, before resampling.
//!
//! Attribute 0 is always the wet/dry mix so hosts can fade any filter in
//! and out without knowing its parameter layout.

use std::sync::Arc;

use crate::fader::{Fader, FaderState};
use crate::types::{Sample, MAX_CHANNELS};

/// Attribute id of the wet/dry mix, common to all filters
pub const FILTER_ATTRIBUTE_WET: u32 = 0;

/// Per-instance filter processor
pub trait FilterInstance: Send {
    /// Process `samples` frames in-place; channel `c` occupies
    /// `buffer[c * stride .. c * stride + samples]`.
    fn filter(
        &mut self,
        buffer: &mut [Sample],
        samples: usize,
        stride: usize,
        channels: usize,
        sample_rate: f32,
        time: f64,
    );

    fn set_filter_parameter(&mut self, attribute: u32, value: f32);

    fn get_filter_parameter(&self, attribute: u32) -> f32;

    fn fade_filter_parameter(&mut self, attribute: u32, to: f32, time: f64, start_time: f64);

    fn oscillate_filter_parameter(
        &mut self,
        attribute: u32,
        from: f32,
        to: f32,
        time: f64,
        start_time: f64,
    );
}

/// Shareable filter definition; attach to sources or global filter slots
pub trait Filter: Send + Sync {
    fn create_instance(&self) -> Box<dyn FilterInstance>;
}

/// Parameter storage shared by filter instances: values plus one fader
/// per attribute, serviced once per processed block.
pub struct FilterParams {
    values: Vec<f32>,
    faders: Vec<Fader>,
    changed: u32,
}

impl FilterParams {
    /// `initial[0]` must be the wet/dry mix
    pub fn new(initial: &[f32]) -> Self {
        debug_assert!(!initial.is_empty() && initial.len() <= 32);
        Self {
            values: initial.to_vec(),
            faders: vec![Fader::new(); initial.len()],
            changed: 0,
        }
    }

    pub fn get(&self, attribute: u32) -> f32 {
        self.values.get(attribute as usize).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, attribute: u32, value: f32) {
        let i = attribute as usize;
        if i < self.values.len() {
            self.values[i] = value;
            self.faders[i].disable();
            self.changed |= 1 << i;
        }
    }

    pub fn fade(&mut self, attribute: u32, to: f32, time: f64, start_time: f64) {
        let i = attribute as usize;
        if i < self.values.len() {
            let from = self.values[i];
            self.faders[i].set(from, to, time, start_time);
        }
    }

    pub fn oscillate(&mut self, attribute: u32, from: f32, to: f32, time: f64, start_time: f64) {
        let i = attribute as usize;
        if i < self.values.len() {
            self.faders[i].set_lfo(from, to, time, start_time);
        }
    }

    /// Service faders; call once per block before reading values
    pub fn update(&mut self, time: f64) {
        for (i, fader) in self.faders.iter_mut().enumerate() {
            if fader.is_driving() {
                self.values[i] = fader.get(time);
                self.changed |= 1 << i;
                if fader.state == FaderState::Inactive {
                    fader.disable();
                }
            }
        }
    }

    /// Bitmask of attributes changed since the last call
    pub fn take_changed(&mut self) -> u32 {
        std::mem::take(&mut self.changed)
    }
}

// ---------------------------------------------------------------------------
// Biquad resonant filter
// ---------------------------------------------------------------------------

/// Biquad response type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadType {
    LowPass,
    HighPass,
    BandPass,
}

/// Resonant biquad filter (RBJ cookbook coefficients)
pub struct BiquadResonantFilter {
    pub filter_type: BiquadType,
    pub frequency: f32,
    pub resonance: f32,
}

impl BiquadResonantFilter {
    /// Attribute ids beyond the common wet/dry mix
    pub const TYPE: u32 = 1;
    pub const FREQUENCY: u32 = 2;
    pub const RESONANCE: u32 = 3;

    pub fn new(filter_type: BiquadType, frequency: f32, resonance: f32) -> Self {
        Self {
            filter_type,
            frequency,
            resonance,
        }
    }
}

impl Filter for BiquadResonantFilter {
    fn create_instance(&self) -> Box<dyn FilterInstance> {
        let type_value = match self.filter_type {
            BiquadType::LowPass => 0.0,
            BiquadType::HighPass => 1.0,
            BiquadType::BandPass => 2.0,
        };
        Box::new(BiquadResonantInstance {
            params: FilterParams::new(&[1.0, type_value, self.frequency, self.resonance]),
            coeffs: BiquadCoeffs::default(),
            state: [BiquadState::default(); MAX_CHANNELS],
            sample_rate: 0.0,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

struct BiquadResonantInstance {
    params: FilterParams,
    coeffs: BiquadCoeffs,
    state: [BiquadState; MAX_CHANNELS],
    sample_rate: f32,
}

impl BiquadResonantInstance {
    fn recompute(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        let freq = self
            .params
            .get(BiquadResonantFilter::FREQUENCY)
            .clamp(10.0, sample_rate * 0.45);
        let q = self.params.get(BiquadResonantFilter::RESONANCE).max(0.01);
        let omega = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let (sn, cs) = omega.sin_cos();
        let alpha = sn / (2.0 * q);
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = match self.params.get(BiquadResonantFilter::TYPE) as i32 {
            1 => {
                // High pass
                let b1 = -(1.0 + cs);
                (-b1 / 2.0, b1, -b1 / 2.0)
            }
            2 => {
                // Band pass (constant peak gain)
                (alpha, 0.0, -alpha)
            }
            _ => {
                // Low pass
                let b1 = 1.0 - cs;
                (b1 / 2.0, b1, b1 / 2.0)
            }
        };

        self.coeffs = BiquadCoeffs {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: (-2.0 * cs) / a0,
            a2: (1.0 - alpha) / a0,
        };
    }
}

impl FilterInstance for BiquadResonantInstance {
    fn filter(
        &mut self,
        buffer: &mut [Sample],
        samples: usize,
        stride: usize,
        channels: usize,
        sample_rate: f32,
        time: f64,
    ) {
        self.params.update(time);
        let changed = self.params.take_changed();
        let coeff_mask = (1 << BiquadResonantFilter::TYPE)
            | (1 << BiquadResonantFilter::FREQUENCY)
            | (1 << BiquadResonantFilter::RESONANCE);
        if changed & coeff_mask != 0 || self.sample_rate != sample_rate {
            self.recompute(sample_rate);
        }

        let wet = self.params.get(FILTER_ATTRIBUTE_WET).clamp(0.0, 1.0);
        let c = self.coeffs;
        for ch in 0..channels.min(MAX_CHANNELS) {
            let s = &mut self.state[ch];
            let row = &mut buffer[ch * stride..ch * stride + samples];
            for sample in row.iter_mut() {
                let x = *sample;
                let y = c.b0 * x + c.b1 * s.x1 + c.b2 * s.x2 - c.a1 * s.y1 - c.a2 * s.y2;
                s.x2 = s.x1;
                s.x1 = x;
                s.y2 = s.y1;
                s.y1 = y;
                *sample = x + (y - x) * wet;
            }
        }
    }

    fn set_filter_parameter(&mut self, attribute: u32, value: f32) {
        self.params.set(attribute, value);
    }

    fn get_filter_parameter(&self, attribute: u32) -> f32 {
        self.params.get(attribute)
    }

    fn fade_filter_parameter(&mut self, attribute: u32, to: f32, time: f64, start_time: f64) {
        self.params.fade(attribute, to, time, start_time);
    }

    fn oscillate_filter_parameter(
        &mut self,
        attribute: u32,
        from: f32,
        to: f32,
        time: f64,
        start_time: f64,
    ) {
        self.params.oscillate(attribute, from, to, time, start_time);
    }
}

// ---------------------------------------------------------------------------
// Echo filter
// ---------------------------------------------------------------------------

/// Simple feedback echo
pub struct EchoFilter {
    /// Delay in seconds
    pub delay: f32,
    /// Feedback amount per repeat, 0..1
    pub decay: f32,
}

impl EchoFilter {
    pub const DELAY: u32 = 1;
    pub const DECAY: u32 = 2;

    pub fn new(delay: f32, decay: f32) -> Self {
        Self { delay, decay }
    }
}

impl Filter for EchoFilter {
    fn create_instance(&self) -> Box<dyn FilterInstance> {
        Box::new(EchoInstance {
            params: FilterParams::new(&[1.0, self.delay, self.decay]),
            // Sized on the first block, once the rate is known
            buffer: Vec::new(),
            frames: 0,
            cursor: 0,
        })
    }
}

struct EchoInstance {
    params: FilterParams,
    /// Planar delay line, `frames` per channel
    buffer: Vec<Sample>,
    frames: usize,
    cursor: usize,
}

impl FilterInstance for EchoInstance {
    fn filter(
        &mut self,
        buffer: &mut [Sample],
        samples: usize,
        stride: usize,
        channels: usize,
        sample_rate: f32,
        time: f64,
    ) {
        self.params.update(time);
        let _ = self.params.take_changed();

        if self.frames == 0 {
            let delay = self.params.get(EchoFilter::DELAY).max(0.001);
            self.frames = (delay * sample_rate) as usize + 1;
            self.buffer = vec![0.0; self.frames * MAX_CHANNELS];
        }

        let wet = self.params.get(FILTER_ATTRIBUTE_WET).clamp(0.0, 1.0);
        let decay = self.params.get(EchoFilter::DECAY).clamp(0.0, 0.999);
        let frames = self.frames;
        let mut cursor = self.cursor;
        for i in 0..samples {
            for ch in 0..channels.min(MAX_CHANNELS) {
                let line = &mut self.buffer[ch * frames..(ch + 1) * frames];
                let x = buffer[ch * stride + i];
                let echoed = line[cursor];
                line[cursor] = x + echoed * decay;
                buffer[ch * stride + i] = x + echoed * wet;
            }
            cursor = (cursor + 1) % frames;
        }
        self.cursor = cursor;
    }

    fn set_filter_parameter(&mut self, attribute: u32, value: f32) {
        self.params.set(attribute, value);
    }

    fn get_filter_parameter(&self, attribute: u32) -> f32 {
        self.params.get(attribute)
    }

    fn fade_filter_parameter(&mut self, attribute: u32, to: f32, time: f64, start_time: f64) {
        self.params.fade(attribute, to, time, start_time);
    }

    fn oscillate_filter_parameter(
        &mut self,
        attribute: u32,
        from: f32,
        to: f32,
        time: f64,
        start_time: f64,
    ) {
        self.params.oscillate(attribute, from, to, time, start_time);
    }
}

/// Convenience alias for attaching shared filters
pub type SharedFilter = Arc<dyn Filter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wet_parameter_roundtrip() {
        let filter = BiquadResonantFilter::new(BiquadType::LowPass, 1000.0, 2.0);
        let mut inst = filter.create_instance();
        assert_eq!(inst.get_filter_parameter(FILTER_ATTRIBUTE_WET), 1.0);
        inst.set_filter_parameter(FILTER_ATTRIBUTE_WET, 0.25);
        assert_eq!(inst.get_filter_parameter(FILTER_ATTRIBUTE_WET), 0.25);
    }

    #[test]
    fn test_lowpass_attenuates_alternating_signal() {
        // A +1/-1 alternating signal sits at the Nyquist frequency; a low
        // cutoff must crush it.
        let filter = BiquadResonantFilter::new(BiquadType::LowPass, 200.0, 0.7);
        let mut inst = filter.create_instance();
        let mut buf: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        inst.filter(&mut buf, 256, 256, 1, 44100.0, 0.0);
        let tail_peak = buf[200..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(tail_peak < 0.1, "nyquist tone not attenuated: {tail_peak}");
    }

    #[test]
    fn test_dry_mix_passes_signal_through() {
        let filter = BiquadResonantFilter::new(BiquadType::HighPass, 8000.0, 1.0);
        let mut inst = filter.create_instance();
        inst.set_filter_parameter(FILTER_ATTRIBUTE_WET, 0.0);
        let original: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut buf = original.clone();
        inst.filter(&mut buf, 64, 64, 1, 44100.0, 0.0);
        for (a, b) in buf.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_echo_repeats_impulse() {
        let filter = EchoFilter::new(0.01, 0.5);
        let mut inst = filter.create_instance();
        let rate = 1000.0; // 10 ms => 10 frames + 1
        let mut buf = vec![0.0f32; 64];
        buf[0] = 1.0;
        inst.filter(&mut buf, 64, 64, 1, rate, 0.0);
        // First repeat lands one delay-line length after the impulse
        let echo_index = 11;
        assert!(buf[echo_index] > 0.9, "missing echo at {echo_index}: {}", buf[echo_index]);
        // Second repeat decayed by `decay`
        assert!((buf[echo_index * 2] - 0.5).abs() < 0.1);
    }

    #[test]
    fn test_echo_parameters_address_the_delay_line() {
        let filter = EchoFilter::new(0.02, 0.3);
        let mut inst = filter.create_instance();
        assert_eq!(inst.get_filter_parameter(EchoFilter::DELAY), 0.02);
        assert_eq!(inst.get_filter_parameter(EchoFilter::DECAY), 0.3);
        // Shorten the delay before the line is sized; the first block
        // must pick the new value up
        inst.set_filter_parameter(EchoFilter::DELAY, 0.005);
        let rate = 1000.0; // 5 ms => 5 frames + 1
        let mut buf = vec![0.0f32; 32];
        buf[0] = 1.0;
        inst.filter(&mut buf, 32, 32, 1, rate, 0.0);
        assert!(buf[6] > 0.9, "echo must follow the updated delay: {}", buf[6]);
    }

    #[test]
    fn test_filter_param_fade_terminates() {
        let mut params = FilterParams::new(&[1.0, 440.0]);
        params.fade(1, 880.0, 1.0, 0.0);
        params.update(0.5);
        let mid = params.get(1);
        assert!((mid - 660.0).abs() < 1.0);
        params.update(2.0);
        assert_eq!(params.get(1), 880.0);
    }
}
