//! 3D spatialization pass
//!
//! All 3D math runs under its own lock, separate from the audio mutex:
//! `update_3d_audio` snapshots which voices are spatial, computes
//! attenuation, doppler and per-speaker gains without blocking the mixer,
//! then commits the results to the voice table in one short critical
//! section. Panning is a per-speaker dot product against the source
//! direction; no HRTF.

use std::sync::Arc;

use crate::handle::Handle;
use crate::source::{AudioAttenuator, AudioCollider, ListenerParams, Params3d, SourceFlags};
use crate::types::{AttenuationModel, MAX_CHANNELS, VOICE_COUNT};

#[inline]
fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn length(v: [f32; 3]) -> f32 {
    dot(v, v).sqrt()
}

#[inline]
fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = length(v);
    if len <= f32::EPSILON {
        [0.0, 0.0, 0.0]
    } else {
        [v[0] / len, v[1] / len, v[2] / len]
    }
}

/// Built-in distance attenuation curves
pub(crate) fn attenuate(
    model: AttenuationModel,
    distance: f32,
    min_distance: f32,
    max_distance: f32,
    rolloff: f32,
) -> f32 {
    let d = distance.clamp(min_distance, max_distance);
    match model {
        AttenuationModel::NoAttenuation => 1.0,
        AttenuationModel::InverseDistance => {
            min_distance / (min_distance + rolloff * (d - min_distance))
        }
        AttenuationModel::LinearDistance => {
            let range = max_distance - min_distance;
            if range <= 0.0 {
                1.0
            } else {
                (1.0 - rolloff * (d - min_distance) / range).clamp(0.0, 1.0)
            }
        }
        AttenuationModel::ExponentialDistance => {
            if min_distance <= 0.0 {
                1.0
            } else {
                (d / min_distance).powf(-rolloff)
            }
        }
    }
}

/// Doppler pitch factor for a source moving relative to the listener.
///
/// `delta` points from listener to source. Approach speeds are capped
/// just below the speed of sound so the factor stays finite.
pub(crate) fn doppler(
    delta: [f32; 3],
    source_velocity: [f32; 3],
    listener_velocity: [f32; 3],
    factor: f32,
    sound_speed: f32,
) -> f32 {
    if factor <= 0.0 {
        return 1.0;
    }
    let dist = length(delta);
    if dist <= f32::EPSILON {
        return 1.0;
    }
    // Velocity components along listener->source; negative means approach
    // (for the source) or retreat (for the listener). Cap approach speeds
    // just below the speed of sound so the factor stays finite.
    let max_approach = -(sound_speed / factor) * 0.99;
    let vls = (dot(delta, listener_velocity) / dist).max(max_approach);
    let vss = (dot(delta, source_velocity) / dist).max(max_approach);
    (sound_speed + factor * vls) / (sound_speed + factor * vss)
}

/// Per-voice 3D state, owned by the spatial lock
pub(crate) struct SpatialVoice {
    /// Generation-checked owner; a stale handle means the slot moved on
    pub handle: Handle,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub min_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub doppler_factor: f32,
    pub attenuation: AttenuationModel,
    pub collider: Option<Arc<dyn AudioCollider>>,
    pub collider_user_data: i32,
    pub attenuator: Option<Arc<dyn AudioAttenuator>>,
    pub listener_relative: bool,
    // Results of the last compute pass
    pub out_volume: f32,
    pub out_doppler: f32,
    pub out_channel_volume: [f32; MAX_CHANNELS],
}

impl SpatialVoice {
    pub fn new(
        handle: Handle,
        spatial: &Params3d,
        flags: &SourceFlags,
        position: [f32; 3],
        velocity: [f32; 3],
    ) -> Self {
        Self {
            handle,
            position,
            velocity,
            min_distance: spatial.min_distance,
            max_distance: spatial.max_distance,
            rolloff_factor: spatial.rolloff_factor,
            doppler_factor: spatial.doppler_factor,
            attenuation: spatial.attenuation,
            collider: spatial.collider.clone(),
            collider_user_data: spatial.collider_user_data,
            attenuator: spatial.attenuator.clone(),
            listener_relative: flags.listener_relative,
            out_volume: 1.0,
            out_doppler: 1.0,
            out_channel_volume: [1.0; MAX_CHANNELS],
        }
    }
}

/// Everything the 3D pass needs, behind its own lock
pub(crate) struct SpatialState {
    pub listener: ListenerParams,
    pub sound_speed: f32,
    pub channels: usize,
    pub speaker_positions: [[f32; 3]; MAX_CHANNELS],
    pub voices: Vec<Option<SpatialVoice>>,
}

impl SpatialState {
    pub fn new(channels: usize, sound_speed: f32) -> Self {
        let mut state = Self {
            listener: ListenerParams::default(),
            sound_speed,
            channels,
            speaker_positions: [[0.0; 3]; MAX_CHANNELS],
            voices: (0..VOICE_COUNT).map(|_| None).collect(),
        };
        state.set_default_speakers(channels);
        state
    }

    /// Default speaker layout for the given output channel count.
    /// The sub channel is the zero vector and receives full gain.
    pub fn set_default_speakers(&mut self, channels: usize) {
        self.channels = channels;
        let fl = [-2.0, 0.0, 1.0];
        let fr = [2.0, 0.0, 1.0];
        let center = [0.0, 0.0, 1.0];
        let sub = [0.0, 0.0, 0.0];
        let rl = [-2.0, 0.0, -1.0];
        let rr = [2.0, 0.0, -1.0];
        let sl = [-2.0, 0.0, 0.0];
        let sr = [2.0, 0.0, 0.0];
        let layout: [[f32; 3]; MAX_CHANNELS] = match channels {
            1 => [sub; MAX_CHANNELS],
            2 => [fl, fr, sub, sub, sub, sub, sub, sub],
            4 => [fl, fr, rl, rr, sub, sub, sub, sub],
            6 => [fl, fr, center, sub, rl, rr, sub, sub],
            _ => [fl, fr, center, sub, rl, rr, sl, sr],
        };
        self.speaker_positions = layout;
    }

    /// Distance from the listener, honoring listener-relative sources
    pub fn listener_distance(&self, voice: &SpatialVoice) -> f32 {
        if voice.listener_relative {
            length(voice.position)
        } else {
            length(sub(voice.position, self.listener.position))
        }
    }

    /// Compute volume, doppler and per-speaker gains for one voice
    pub fn compute(&self, voice: &mut SpatialVoice) {
        let delta = if voice.listener_relative {
            voice.position
        } else {
            sub(voice.position, self.listener.position)
        };
        let distance = length(delta);

        let mut volume = match &voice.collider {
            Some(collider) => collider
                .collide(&self.listener, voice.position, voice.collider_user_data)
                .clamp(0.0, 1.0),
            None => 1.0,
        };
        volume *= match &voice.attenuator {
            Some(att) => att.attenuate(
                distance,
                voice.min_distance,
                voice.max_distance,
                voice.rolloff_factor,
            ),
            None => attenuate(
                voice.attenuation,
                distance,
                voice.min_distance,
                voice.max_distance,
                voice.rolloff_factor,
            ),
        };

        voice.out_doppler = doppler(
            delta,
            voice.velocity,
            self.listener.velocity,
            voice.doppler_factor,
            self.sound_speed,
        );

        let direction = normalize(delta);
        for ch in 0..self.channels {
            let speaker = self.speaker_positions[ch];
            if length(speaker) <= f32::EPSILON || distance <= f32::EPSILON {
                // Sub channel, mono layout, or a source at the listener's
                // position: no direction to pan by
                voice.out_channel_volume[ch] = 1.0;
            } else {
                let alignment = dot(normalize(speaker), direction) * 0.5 + 0.5;
                voice.out_channel_volume[ch] = alignment;
            }
        }
        for ch in self.channels..MAX_CHANNELS {
            voice.out_channel_volume[ch] = 1.0;
        }
        voice.out_volume = volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_attenuation_endpoints() {
        let model = AttenuationModel::LinearDistance;
        assert!((attenuate(model, 1.0, 1.0, 101.0, 1.0) - 1.0).abs() < 1e-6);
        assert!(attenuate(model, 101.0, 1.0, 101.0, 1.0).abs() < 1e-6);
        // Halfway
        assert!((attenuate(model, 51.0, 1.0, 101.0, 1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_inverse_attenuation_formula() {
        let v = attenuate(AttenuationModel::InverseDistance, 11.0, 1.0, 100.0, 1.0);
        assert!((v - 1.0 / 11.0).abs() < 1e-6);
        // Rolloff scales the denominator growth
        let v = attenuate(AttenuationModel::InverseDistance, 11.0, 1.0, 100.0, 2.0);
        assert!((v - 1.0 / 21.0).abs() < 1e-6);
    }

    #[test]
    fn test_exponential_attenuation_formula() {
        let v = attenuate(AttenuationModel::ExponentialDistance, 4.0, 2.0, 100.0, 1.0);
        assert!((v - 0.5).abs() < 1e-6);
        let v = attenuate(AttenuationModel::ExponentialDistance, 4.0, 2.0, 100.0, 2.0);
        assert!((v - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_distance_clamped_to_range() {
        // Closer than min and farther than max are flat
        let model = AttenuationModel::InverseDistance;
        let near = attenuate(model, 0.1, 1.0, 10.0, 1.0);
        assert!((near - 1.0).abs() < 1e-6);
        let far = attenuate(model, 50.0, 1.0, 10.0, 1.0);
        let at_max = attenuate(model, 10.0, 1.0, 10.0, 1.0);
        assert_eq!(far, at_max);
    }

    #[test]
    fn test_doppler_approaching_source_raises_pitch() {
        // Source ahead of the listener, moving toward it (negative z
        // velocity while the delta is +z... delta is listener->source)
        let delta = [0.0, 0.0, 10.0];
        let source_vel = [0.0, 0.0, -34.3]; // moving toward listener
        let factor = doppler(delta, source_vel, [0.0; 3], 1.0, 343.0);
        assert!(factor > 1.0, "approaching source must raise pitch: {factor}");

        let receding = doppler(delta, [0.0, 0.0, 34.3], [0.0; 3], 1.0, 343.0);
        assert!(receding < 1.0);
    }

    #[test]
    fn test_doppler_neutral_cases() {
        assert_eq!(doppler([0.0; 3], [1.0; 3], [0.0; 3], 1.0, 343.0), 1.0);
        assert_eq!(doppler([1.0, 0.0, 0.0], [0.0; 3], [0.0; 3], 0.0, 343.0), 1.0);
    }

    #[test]
    fn test_speaker_panning_favors_near_side() {
        let state = SpatialState::new(2, 343.0);
        let params = Params3d::default();
        let flags = SourceFlags::default();
        let mut voice = SpatialVoice::new(
            Handle::from_raw(0x1001),
            &params,
            &flags,
            [-5.0, 0.0, 1.0],
            [0.0; 3],
        );
        state.compute(&mut voice);
        assert!(
            voice.out_channel_volume[0] > voice.out_channel_volume[1],
            "left source must favor the left speaker: {:?}",
            &voice.out_channel_volume[..2]
        );
    }

    #[test]
    fn test_source_at_listener_is_unpanned() {
        let state = SpatialState::new(2, 343.0);
        let params = Params3d::default();
        let flags = SourceFlags::default();
        let mut voice =
            SpatialVoice::new(Handle::from_raw(0x1001), &params, &flags, [0.0; 3], [0.0; 3]);
        state.compute(&mut voice);
        assert_eq!(voice.out_channel_volume[0], 1.0);
        assert_eq!(voice.out_channel_volume[1], 1.0);
    }
}
