//! The per-quantum mixing pipeline
//!
//! `mix_internal` runs once per output quantum under the audio mutex:
//! clock advance and fader housekeeping, audibility triage (when dirty),
//! then a recursive descent from the primary bus. Each audible voice is
//! fetched in granularity blocks, filtered at its source rate, resampled
//! with a 16.16 cursor, panned and expanded into its bus, and finally the
//! primary bus is run through the global filters and the clip stage.
//!
//! Bus voices are taken out of the voice table while they mix, so the
//! recursion can re-enter the table; a bus routed to itself is simply
//! absent for the duration and contributes silence.

use crate::buffer::AlignedFloatBuffer;
use crate::fader::FaderState;
use crate::handle::Handle;
use crate::resampler::resample;
use crate::source::{SeekFlags, VoiceOutput};
use crate::types::{
    ClipBehavior, Sample, FIXPOINT_FRAC_BITS, FIXPOINT_FRAC_MASK, MAX_CHANNELS, SAMPLE_GRANULARITY,
};
use crate::voice::Voice;

use super::engine::{EngineInner, ResamplePair};

impl EngineInner {
    /// Mix one quantum into planar rows of `self.scratch`; returns the
    /// number of frames produced
    pub(crate) fn mix_internal(&mut self, samples: usize) -> usize {
        let samples = samples.min(self.buffer_size);
        if samples == 0 {
            return 0;
        }
        let buffer_time = samples as f64 / f64::from(self.sample_rate);
        let global_volume_0 = self.global_volume;
        self.stream_time += buffer_time;
        if self.last_clocked_time != 0.0 {
            self.last_clocked_time += buffer_time;
        }
        if self.global_volume_fader.is_driving() {
            let now = self.stream_time;
            self.global_volume = self.global_volume_fader.get(now);
        }
        let global_volume_1 = self.global_volume;

        self.service_faders(buffer_time);

        if self.active_voice_dirty {
            self.calc_active_voices();
        }

        let mut output = std::mem::take(&mut self.output_scratch);
        let mut scratch = std::mem::take(&mut self.scratch);
        let stride = self.scratch_frames;
        let (rate, channels) = (self.sample_rate, self.channels);
        self.mix_bus(
            output.as_mut_slice(),
            samples,
            stride,
            &mut scratch,
            Handle::PRIMARY,
            rate,
            channels,
        );

        let time = self.stream_time;
        for instance in self.global_filter_instances.iter_mut().flatten() {
            instance.filter(output.as_mut_slice(), samples, stride, channels, rate, time);
        }

        self.clip_internal(
            output.as_slice(),
            scratch.as_mut_slice(),
            samples,
            global_volume_0,
            global_volume_1,
        );

        self.output_scratch = output;
        self.scratch = scratch;
        samples
    }

    /// Advance per-voice clocks, faders and schedulers by one quantum
    fn service_faders(&mut self, buffer_time: f64) {
        let mut dirty = false;
        for slot in 0..self.highest_voice {
            let mut stop = false;
            if let Some(voice) = self.voices[slot].as_mut() {
                if voice.flags.paused {
                    continue;
                }
                voice.active_fader = false;
                let dt = buffer_time * f64::from(voice.overall_relative_play_speed);
                voice.stream_time += dt;
                voice.stream_position += dt;
                let now = voice.stream_time;

                if voice.relative_play_speed_fader.is_driving() {
                    let speed = voice.relative_play_speed_fader.get(now);
                    if speed > 0.0 {
                        voice.set_relative_play_speed = speed;
                        voice.overall_relative_play_speed = speed * voice.doppler;
                    }
                    voice.active_fader = true;
                }
                if voice.volume_fader.is_driving() {
                    voice.set_volume = voice.volume_fader.get(now);
                    dirty |= voice.recompute_volume();
                    voice.active_fader = true;
                }
                if voice.pan_fader.is_driving() {
                    let pan = voice.pan_fader.get(now);
                    voice.set_pan(pan);
                    voice.active_fader = true;
                }
                if voice.pause_scheduler.state == FaderState::Active {
                    voice.pause_scheduler.get(now);
                    if voice.pause_scheduler.state == FaderState::Inactive {
                        // Consume the completion so it applies exactly once
                        voice.pause_scheduler.disable();
                        voice.flags.paused = true;
                        dirty = true;
                    }
                }
                if voice.stop_scheduler.state == FaderState::Active {
                    voice.stop_scheduler.get(now);
                    if voice.stop_scheduler.state == FaderState::Inactive {
                        voice.stop_scheduler.disable();
                        stop = true;
                    }
                }
            }
            if stop {
                self.stop_voice_internal(slot);
            }
        }
        if dirty {
            self.active_voice_dirty = true;
        }
    }

    /// Sum every active voice routed to `bus` into planar `dst` rows.
    ///
    /// `scratch` must have the same row stride as `dst` and at least
    /// `MAX_CHANNELS` rows; it holds one voice's resampled output at a
    /// time before panning.
    pub(crate) fn mix_bus(
        &mut self,
        dst: &mut [Sample],
        samples: usize,
        dst_stride: usize,
        scratch: &mut AlignedFloatBuffer,
        bus: Handle,
        bus_sample_rate: f32,
        bus_channels: usize,
    ) {
        for ch in 0..bus_channels {
            dst[ch * dst_stride..ch * dst_stride + samples].fill(0.0);
        }

        for idx in 0..self.active_voice_count {
            let slot = self.active_voices[idx];
            let routed = self.voices[slot]
                .as_ref()
                .is_some_and(|v| v.bus_handle == bus && !v.flags.paused);
            if !routed {
                continue;
            }
            // Take the voice out of the table so bus recursion can
            // re-enter it
            let Some(mut voice) = self.voices[slot].take() else {
                continue;
            };

            let audible = !voice.flags.inaudible;
            if audible && voice.pool_slot.is_some() {
                self.mix_voice(
                    &mut voice,
                    dst,
                    samples,
                    dst_stride,
                    scratch,
                    bus_sample_rate,
                    bus_channels,
                );
            } else if audible || voice.flags.tick_when_inaudible {
                // Over the mix budget, or inaudible but must keep advancing
                self.tick_voice(&mut voice, samples, bus_sample_rate);
            }

            let kill = !audible && voice.flags.kill_when_inaudible;
            let ended = match &voice.output {
                VoiceOutput::Stream(stream) => {
                    stream.has_ended() && !voice.flags.looping && !voice.flags.disable_autostop
                }
                VoiceOutput::Bus(_) => false,
            };
            if kill || ended {
                if let Some(pool) = voice.pool_slot {
                    self.pool_owner[pool] = None;
                }
                self.active_voice_dirty = true;
                // Deferred to the GC thread
                drop(voice);
                while self.highest_voice > 0 && self.voices[self.highest_voice - 1].is_none() {
                    self.highest_voice -= 1;
                }
            } else {
                self.voices[slot] = Some(voice);
            }
        }
    }

    /// Fetch, resample and pan one audible voice into `dst`
    fn mix_voice(
        &mut self,
        voice: &mut Voice,
        dst: &mut [Sample],
        samples: usize,
        dst_stride: usize,
        scratch: &mut AlignedFloatBuffer,
        bus_sample_rate: f32,
        bus_channels: usize,
    ) {
        let Some(pool) = voice.pool_slot else { return };
        let step_fixed = step_for(voice.rate_ratio(bus_sample_rate));
        let channels = voice.channels;
        let mut outofs = 0usize;

        if voice.delay_samples > 0 {
            let skip = voice.delay_samples.min(samples);
            for ch in 0..channels {
                scratch.as_mut_slice()[ch * dst_stride..ch * dst_stride + skip].fill(0.0);
            }
            voice.delay_samples -= skip;
            outofs = skip;
        }

        if step_fixed > 0 {
            let mut pair = std::mem::take(&mut self.resample_pool[pool]);
            while outofs < samples {
                let mut block_fp = (voice.block_frames as i64) << FIXPOINT_FRAC_BITS;
                if voice.block_frames == 0 || voice.src_offset >= block_fp {
                    voice.src_offset -= block_fp;
                    self.fetch_block(voice, &mut pair, samples - outofs, step_fixed);
                    if voice.block_frames == 0 {
                        break;
                    }
                    block_fp = (voice.block_frames as i64) << FIXPOINT_FRAC_BITS;
                }
                let avail = (block_fp - voice.src_offset + step_fixed - 1) / step_fixed;
                let write = (avail.max(0) as usize).min(samples - outofs);
                if write == 0 {
                    break;
                }
                let prev = pair.prev.as_slice();
                let cur = pair.curr.as_slice();
                let out = scratch.as_mut_slice();
                for ch in 0..channels {
                    resample(
                        self.resample_mode,
                        &prev[ch * SAMPLE_GRANULARITY..(ch + 1) * SAMPLE_GRANULARITY],
                        &cur[ch * SAMPLE_GRANULARITY..(ch + 1) * SAMPLE_GRANULARITY],
                        voice.prev_block_frames,
                        voice.block_frames,
                        &mut out[ch * dst_stride + outofs..ch * dst_stride + outofs + write],
                        voice.src_offset,
                        step_fixed,
                    );
                }
                voice.src_offset += write as i64 * step_fixed;
                outofs += write;
            }
            self.resample_pool[pool] = pair;
        }

        // Stream ran out (or the cursor is frozen): pad with silence so
        // panning reads defined data
        if outofs < samples {
            for ch in 0..channels {
                scratch.as_mut_slice()[ch * dst_stride + outofs..ch * dst_stride + samples]
                    .fill(0.0);
            }
        }

        pan_and_expand(
            voice,
            dst,
            samples,
            dst_stride,
            scratch.as_slice(),
            dst_stride,
            bus_channels,
        );
    }

    /// Advance an active voice's read cursor without producing output.
    /// Used for inaudible must-tick voices and audible voices over the
    /// mix budget; keeps streams, loops and filters in step.
    fn tick_voice(&mut self, voice: &mut Voice, samples: usize, bus_sample_rate: f32) {
        let step_fixed = step_for(voice.rate_ratio(bus_sample_rate));
        let mut remaining = samples;
        if voice.delay_samples > 0 {
            let skip = voice.delay_samples.min(remaining);
            voice.delay_samples -= skip;
            remaining -= skip;
        }
        if step_fixed == 0 || remaining == 0 {
            return;
        }

        let mut pair = match voice.pool_slot {
            Some(pool) => std::mem::take(&mut self.resample_pool[pool]),
            None => std::mem::take(&mut self.tick_pair),
        };
        if pair.curr.is_empty() {
            // Nested tick inside an already-ticking bus; the spare pair is
            // in use above us, so this voice just stalls for the quantum
            return;
        }

        let mut outofs = 0usize;
        while outofs < remaining {
            let mut block_fp = (voice.block_frames as i64) << FIXPOINT_FRAC_BITS;
            if voice.block_frames == 0 || voice.src_offset >= block_fp {
                voice.src_offset -= block_fp;
                self.fetch_block(voice, &mut pair, remaining - outofs, step_fixed);
                if voice.block_frames == 0 {
                    break;
                }
                block_fp = (voice.block_frames as i64) << FIXPOINT_FRAC_BITS;
            }
            let avail = (block_fp - voice.src_offset + step_fixed - 1) / step_fixed;
            let write = (avail.max(0) as usize).min(remaining - outofs);
            if write == 0 {
                break;
            }
            voice.src_offset += write as i64 * step_fixed;
            outofs += write;
        }

        match voice.pool_slot {
            Some(pool) => self.resample_pool[pool] = pair,
            None => self.tick_pair = pair,
        }
    }

    /// Pull the next source block into `pair.curr`, sized to what the
    /// remaining output actually needs (plus kernel lookahead when the
    /// cursor is fractional), so source consumption tracks the cursor
    /// exactly at integer rates.
    fn fetch_block(
        &mut self,
        voice: &mut Voice,
        pair: &mut ResamplePair,
        out_remaining: usize,
        step_fixed: i64,
    ) {
        std::mem::swap(&mut pair.curr, &mut pair.prev);
        voice.prev_block_frames = voice.block_frames;

        let remainder = voice.src_offset.max(0);
        let span = remainder + (out_remaining.max(1) as i64 - 1) * step_fixed;
        let mut needed = ((span >> FIXPOINT_FRAC_BITS) + 1) as usize;
        if (step_fixed | remainder) & FIXPOINT_FRAC_MASK != 0 {
            needed += self.resample_mode.lookahead();
        }
        let needed = needed.clamp(1, SAMPLE_GRANULARITY);

        let channels = voice.channels;
        let base_rate = voice.base_sample_rate;
        let time = voice.stream_time;
        let mut loops = 0u32;

        let read = match &mut voice.output {
            VoiceOutput::Stream(stream) => {
                let mut read = stream.get_audio(pair.curr.as_mut_slice(), needed, SAMPLE_GRANULARITY);
                if voice.flags.looping {
                    let target = (voice.loop_point * f64::from(base_rate)) as u64;
                    let mut seek_scratch = [0.0f32; SAMPLE_GRANULARITY];
                    while read < needed {
                        match stream.seek(target, &mut seek_scratch, SeekFlags::default()) {
                            Ok(reached) if !reached.end_of_stream => {
                                loops += 1;
                                // Offsetting the slice start shifts every
                                // channel row by `read` frames
                                let buf = pair.curr.as_mut_slice();
                                let more = stream.get_audio(
                                    &mut buf[read..],
                                    needed - read,
                                    SAMPLE_GRANULARITY,
                                );
                                if more == 0 {
                                    break;
                                }
                                read += more;
                            }
                            _ => break,
                        }
                    }
                }
                read
            }
            VoiceOutput::Bus(state) => {
                let mut bus_scratch = std::mem::take(&mut state.scratch);
                let channel = state.channel;
                self.mix_bus(
                    pair.curr.as_mut_slice(),
                    needed,
                    SAMPLE_GRANULARITY,
                    &mut bus_scratch,
                    channel,
                    base_rate,
                    channels,
                );
                if let Some(viz) = &state.viz {
                    viz.accumulate(pair.curr.as_slice(), needed, SAMPLE_GRANULARITY, channels);
                }
                state.scratch = bus_scratch;
                needed
            }
        };
        voice.loop_count += loops;

        if read < needed {
            let buf = pair.curr.as_mut_slice();
            for ch in 0..channels {
                buf[ch * SAMPLE_GRANULARITY + read..ch * SAMPLE_GRANULARITY + needed].fill(0.0);
            }
        }
        voice.block_frames = if read == 0 { 0 } else { needed };

        if voice.block_frames > 0 {
            for instance in voice.filters.iter_mut().flatten() {
                instance.filter(
                    pair.curr.as_mut_slice(),
                    needed,
                    SAMPLE_GRANULARITY,
                    channels,
                    base_rate,
                    time,
                );
            }
        }
    }

    /// Apply the global volume ramp and output clipping, `src` rows into
    /// `dst` rows
    fn clip_internal(&self, src: &[Sample], dst: &mut [Sample], samples: usize, v0: f32, v1: f32) {
        let stride = self.scratch_frames;
        for ch in 0..self.channels {
            clip_row(
                self.clip_behavior,
                &src[ch * stride..ch * stride + samples],
                &mut dst[ch * stride..ch * stride + samples],
                v0,
                v1,
                self.post_clip_scaler,
            );
        }
    }
}

/// 16.16 cursor step for a resample ratio; absurd ratios freeze the
/// cursor instead of overflowing the fixed-point step
fn step_for(ratio: f32) -> i64 {
    if !(ratio > 0.0) || ratio > 65536.0 {
        0
    } else {
        (f64::from(ratio) * 65536.0) as i64
    }
}

/// Accumulate one voice's planar rows into its bus, applying per-channel
/// gain ramps and the channel expansion matrix.
///
/// Gains move linearly from last quantum's value to the current target
/// across the block, so volume, pan and 3D updates never click.
fn pan_and_expand(
    voice: &mut Voice,
    dst: &mut [Sample],
    samples: usize,
    dst_stride: usize,
    src: &[Sample],
    src_stride: usize,
    dst_channels: usize,
) {
    let src_channels = voice.channels;
    for ch in 0..dst_channels {
        let target = voice.channel_volume[ch] * voice.overall_volume;
        let mut vol = voice.current_channel_volume[ch];
        let inc = (target - vol) / samples as f32;
        let (taps, tap_count) = expand_taps(dst_channels, src_channels, ch);
        let row = &mut dst[ch * dst_stride..ch * dst_stride + samples];
        for (i, out) in row.iter_mut().enumerate() {
            vol += inc;
            let mut acc = 0.0;
            for &(src_ch, gain) in &taps[..tap_count] {
                acc += src[src_ch * src_stride + i] * gain;
            }
            *out += acc * vol;
        }
        voice.current_channel_volume[ch] = target;
    }
}

/// Source-channel taps feeding output channel `ch` when a voice's channel
/// count differs from its bus's. Downmixes fold center/sub/rears into the
/// front pair; upmixes duplicate the front pair and derive center and sub
/// from its average.
fn expand_taps(
    dst_channels: usize,
    src_channels: usize,
    ch: usize,
) -> ([(usize, f32); MAX_CHANNELS], usize) {
    let mut taps = [(0usize, 0.0f32); MAX_CHANNELS];
    let mut count = 0usize;
    let mut push = |src_ch: usize, gain: f32| {
        taps[count] = (src_ch, gain);
        count += 1;
    };

    if src_channels == dst_channels {
        push(ch, 1.0);
    } else if src_channels == 1 {
        push(0, 1.0);
    } else if dst_channels == 1 {
        let gain = 1.0 / src_channels as f32;
        for src_ch in 0..src_channels {
            push(src_ch, gain);
        }
    } else if dst_channels == 2 {
        let side = ch; // 0 = left, 1 = right
        push(side, 1.0);
        if src_channels >= 4 {
            if src_channels == 4 {
                push(2 + side, 0.7);
            } else {
                push(2, 0.7); // center
                push(3, 0.5); // sub
                push(4 + side, 0.7); // rear
                if src_channels >= 8 {
                    push(6 + side, 0.7); // side
                }
            }
        }
    } else if dst_channels == 4 {
        match src_channels {
            2 => push(ch & 1, 1.0),
            6 | 8 => match ch {
                0 | 1 => {
                    push(ch, 1.0);
                    push(2, 0.7);
                    push(3, 0.5);
                    if src_channels == 8 {
                        push(6 + ch, 0.5);
                    }
                }
                _ => {
                    push(2 + ch, 1.0); // rears
                    if src_channels == 8 {
                        push(4 + ch, 0.5); // fold the sides in
                    }
                }
            },
            _ => push(ch % src_channels, 1.0),
        }
    } else if dst_channels == 6 {
        match src_channels {
            2 => match ch {
                0 | 1 => push(ch, 1.0),
                2 | 3 => {
                    push(0, 0.5);
                    push(1, 0.5);
                }
                _ => push(ch - 4, 1.0),
            },
            4 => match ch {
                0 | 1 => push(ch, 1.0),
                2 | 3 => {
                    push(0, 0.5);
                    push(1, 0.5);
                }
                _ => push(ch - 2, 1.0),
            },
            8 => match ch {
                0 | 1 => {
                    push(ch, 1.0);
                    push(6 + ch, 0.5);
                }
                4 | 5 => {
                    push(ch, 1.0);
                    push(2 + ch, 0.5);
                }
                _ => push(ch, 1.0),
            },
            _ => push(ch % src_channels, 1.0),
        }
    } else if dst_channels == 8 {
        match src_channels {
            2 => match ch {
                2 | 3 => {
                    push(0, 0.5);
                    push(1, 0.5);
                }
                _ => push(ch & 1, 1.0),
            },
            4 => match ch {
                0 | 1 => push(ch, 1.0),
                2 | 3 => {
                    push(0, 0.5);
                    push(1, 0.5);
                }
                4 | 5 => push(ch - 2, 1.0),
                _ => {
                    // Sides average front and rear
                    push(ch - 6, 0.5);
                    push(ch - 4, 0.5);
                }
            },
            6 => match ch {
                6 | 7 => {
                    push(ch - 6, 0.5);
                    push(ch - 2, 0.5);
                }
                _ => push(ch, 1.0),
            },
            _ => push(ch % src_channels, 1.0),
        }
    } else {
        push(ch % src_channels.max(1), 1.0);
    }

    (taps, count)
}

/// Cubic soft clip: linear-ish below the knee, saturating toward
/// +-0.9862875 at the +-1.65 bounds
#[inline]
fn soft_clip(f: f32) -> f32 {
    if f <= -1.65 {
        -0.9862875
    } else if f >= 1.65 {
        0.9862875
    } else {
        0.87 * f - 0.1 * f * f * f
    }
}

/// Clip one channel row with a linear global-volume ramp from `v0` to `v1`
pub(crate) fn clip_row(
    behavior: ClipBehavior,
    src: &[Sample],
    dst: &mut [Sample],
    v0: f32,
    v1: f32,
    post_clip_scaler: f32,
) {
    if src.len() % 4 == 0 {
        clip_row_unrolled(behavior, src, dst, v0, v1, post_clip_scaler);
    } else {
        clip_row_scalar(behavior, src, dst, v0, v1, post_clip_scaler);
    }
}

fn clip_row_scalar(
    behavior: ClipBehavior,
    src: &[Sample],
    dst: &mut [Sample],
    v0: f32,
    v1: f32,
    post_clip_scaler: f32,
) {
    let vd = (v1 - v0) / src.len() as f32;
    let mut v = v0;
    for (out, &s) in dst.iter_mut().zip(src.iter()) {
        let f = s * v;
        v += vd;
        *out = match behavior {
            ClipBehavior::Hard => f.clamp(-1.0, 1.0),
            ClipBehavior::SoftKnee => soft_clip(f),
        } * post_clip_scaler;
    }
}

/// Four-wide unrolled variant of `clip_row_scalar`; identical math, laid
/// out for the vectorizer on the aligned scratch rows
fn clip_row_unrolled(
    behavior: ClipBehavior,
    src: &[Sample],
    dst: &mut [Sample],
    v0: f32,
    v1: f32,
    post_clip_scaler: f32,
) {
    let vd = (v1 - v0) / src.len() as f32;
    let mut v = [v0, v0 + vd, v0 + 2.0 * vd, v0 + 3.0 * vd];
    let step = 4.0 * vd;
    for (out4, in4) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        for lane in 0..4 {
            let f = in4[lane] * v[lane];
            out4[lane] = match behavior {
                ClipBehavior::Hard => f.clamp(-1.0, 1.0),
                ClipBehavior::SoftKnee => soft_clip(f),
            } * post_clip_scaler;
            v[lane] += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_clip_bounds_and_knee() {
        assert_eq!(soft_clip(10.0), 0.9862875);
        assert_eq!(soft_clip(-10.0), -0.9862875);
        // Inside the knee the curve is the plain cubic
        let f = 0.5f32;
        assert!((soft_clip(f) - (0.87 * f - 0.1 * f * f * f)).abs() < 1e-7);
        // Continuous at the knee edge
        assert!((soft_clip(1.65) - soft_clip(1.6499999)).abs() < 1e-3);
    }

    #[test]
    fn test_clip_hard_clamps_and_scales() {
        let src = [2.0, -2.0, 0.5, 0.0];
        let mut dst = [0.0; 4];
        clip_row(ClipBehavior::Hard, &src, &mut dst, 1.0, 1.0, 0.95);
        assert_eq!(dst, [0.95, -0.95, 0.475, 0.0]);
    }

    #[test]
    fn test_clip_unrolled_matches_scalar() {
        let src: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.37).sin() * 2.5).collect();
        for behavior in [ClipBehavior::Hard, ClipBehavior::SoftKnee] {
            let mut a = vec![0.0; 64];
            let mut b = vec![0.0; 64];
            clip_row_scalar(behavior, &src, &mut a, 0.2, 1.3, 0.95);
            clip_row_unrolled(behavior, &src, &mut b, 0.2, 1.3, 0.95);
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_clip_ramps_global_volume() {
        let src = [1.0; 8];
        let mut dst = [0.0; 8];
        clip_row(ClipBehavior::Hard, &src, &mut dst, 0.0, 0.8, 1.0);
        // v starts at v0 and steps by (v1 - v0) / n each sample
        for (i, &s) in dst.iter().enumerate() {
            assert!((s - 0.1 * i as f32).abs() < 1e-6, "sample {i}: {s}");
        }
    }

    #[test]
    fn test_step_for_guards_overflow() {
        assert_eq!(step_for(1.0), 65536);
        assert_eq!(step_for(0.5), 32768);
        assert_eq!(step_for(0.0), 0);
        assert_eq!(step_for(-1.0), 0);
        assert_eq!(step_for(100_000.0), 0);
        assert_eq!(step_for(f32::NAN), 0);
    }

    #[test]
    fn test_expand_taps_identity() {
        for channels in [1usize, 2, 4, 6, 8] {
            for ch in 0..channels {
                let (taps, n) = expand_taps(channels, channels, ch);
                assert_eq!(n, 1);
                assert_eq!(taps[0], (ch, 1.0));
            }
        }
    }

    #[test]
    fn test_expand_taps_mono_to_any() {
        for channels in [2usize, 4, 6, 8] {
            for ch in 0..channels {
                let (taps, n) = expand_taps(channels, 1, ch);
                assert_eq!(n, 1);
                assert_eq!(taps[0], (0, 1.0));
            }
        }
    }

    #[test]
    fn test_expand_taps_downmix_to_mono_preserves_energy() {
        for src in [2usize, 4, 6, 8] {
            let (taps, n) = expand_taps(1, src, 0);
            assert_eq!(n, src);
            let sum: f32 = taps[..n].iter().map(|&(_, g)| g).sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_expand_taps_surround_to_stereo_folds_center() {
        let (taps, n) = expand_taps(2, 6, 0);
        assert_eq!(&taps[..n], &[(0, 1.0), (2, 0.7), (3, 0.5), (4, 0.7)]);
        let (taps, n) = expand_taps(2, 6, 1);
        assert_eq!(&taps[..n], &[(1, 1.0), (2, 0.7), (3, 0.5), (5, 0.7)]);
    }

    #[test]
    fn test_expand_taps_stereo_to_surround_derives_center() {
        // Center and sub take the averaged front pair
        for ch in [2usize, 3] {
            let (taps, n) = expand_taps(6, 2, ch);
            assert_eq!(&taps[..n], &[(0, 0.5), (1, 0.5)]);
        }
        // Rears duplicate the fronts
        assert_eq!(expand_taps(6, 2, 4).0[0], (0, 1.0));
        assert_eq!(expand_taps(6, 2, 5).0[0], (1, 1.0));
    }
}
