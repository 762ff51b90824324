//! End-to-end mixing tests through the public API.
//!
//! These use hard clipping with a unity post-clip scaler so expected
//! sample values can be computed by hand. Center pan puts cos(pi/4) on
//! both sides of the stereo pair.

use std::sync::Arc;

use polymix_core::{
    Bus, ClipBehavior, Engine, EngineConfig, Handle, MockBackend, ResampleMode, SampleBuffer,
};

const PAN: f32 = std::f32::consts::FRAC_1_SQRT_2;

fn exact_engine(frames: usize) -> Engine {
    Engine::new(&EngineConfig {
        sample_rate: 44100,
        buffer_size: frames,
        channels: 2,
        max_active_voices: 16,
        resample_mode: ResampleMode::Linear,
        clip_behavior: ClipBehavior::Hard,
        post_clip_scaler: 1.0,
    })
    .unwrap()
}

fn mono(data: Vec<f32>) -> SampleBuffer {
    SampleBuffer::from_planar(data, 44100.0, 1).unwrap()
}

fn mix_frames(engine: &Engine, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames * 2];
    engine.mix(&mut out);
    out
}

#[test]
fn looping_buffer_is_sample_exact_at_unity_rate() {
    let engine = exact_engine(8);
    let mut source = mono(vec![0.5, -0.5, 0.25, -0.25]);
    source.params_mut().flags.looping = true;

    let handle = engine.play(&source).unwrap();
    let out = mix_frames(&engine, 8);

    // Two full passes over the 4-frame buffer, gain = center pan
    let pattern = [0.5, -0.5, 0.25, -0.25];
    for i in 0..8 {
        let expected = pattern[i % 4] * PAN;
        assert!(
            (out[i * 2] - expected).abs() < 1e-5,
            "L frame {i}: {} != {expected}",
            out[i * 2]
        );
        assert!((out[i * 2 + 1] - expected).abs() < 1e-5, "R frame {i}");
    }
    assert_eq!(engine.loop_count(handle), Some(1));
}

#[test]
fn handles_go_stale_when_voices_stop() {
    let engine = exact_engine(64);
    let source = mono(vec![0.1; 1024]);

    let handle = engine.play(&source).unwrap();
    assert!(engine.is_valid_voice_handle(handle));
    assert_eq!(engine.volume(handle), Some(1.0));

    engine.stop(handle);
    assert!(!engine.is_valid_voice_handle(handle));
    assert_eq!(engine.volume(handle), None);
    // Operations through a stale handle are no-ops, not errors
    engine.set_volume(handle, 0.5);
    engine.set_pause(handle, true);
    assert_eq!(engine.voice_count(), 0);
}

#[test]
fn finished_voice_is_reaped_and_its_handle_dies() {
    let engine = exact_engine(64);
    let source = mono(vec![0.2; 16]);
    let handle = engine.play(&source).unwrap();

    // 16 frames of audio, 64-frame quantum: ends within the first mix
    mix_frames(&engine, 64);
    mix_frames(&engine, 64);
    assert!(!engine.is_valid_voice_handle(handle));
    assert_eq!(engine.voice_count(), 0);
}

#[test]
fn triage_mixes_only_the_loudest_voices() {
    let engine = Engine::new(&EngineConfig {
        sample_rate: 44100,
        buffer_size: 64,
        channels: 2,
        max_active_voices: 1,
        resample_mode: ResampleMode::Linear,
        clip_behavior: ClipBehavior::Hard,
        post_clip_scaler: 1.0,
    })
    .unwrap();

    let loud = mono(vec![0.4; 1024]);
    let quiet = mono(vec![0.4; 1024]);
    engine.play(&quiet).map(|h| engine.set_volume(h, 0.05)).unwrap();
    engine.play(&loud).unwrap();

    assert_eq!(engine.active_voice_count(), 1);
    let out = mix_frames(&engine, 64);
    // Only the loud voice is in the budget; the quiet one would have
    // added 0.4 * 0.05 * pan ~= 0.014
    let expected = 0.4 * PAN;
    assert!((out[0] - expected).abs() < 1e-3, "got {}", out[0]);
}

#[test]
fn single_instance_source_replaces_its_voice() {
    let engine = exact_engine(64);
    let mut source = mono(vec![0.3; 4096]);
    source.params_mut().flags.single_instance = true;

    let first = engine.play(&source).unwrap();
    let second = engine.play(&source).unwrap();
    assert!(!engine.is_valid_voice_handle(first));
    assert!(engine.is_valid_voice_handle(second));
    assert_eq!(engine.voice_count(), 1);
}

#[test]
fn scheduled_pause_fires_exactly_once() {
    let engine = exact_engine(128);
    let mut source = mono(vec![0.3; 256]);
    source.params_mut().flags.looping = true;

    let handle = engine.play(&source).unwrap();
    engine.schedule_pause(handle, 0.001); // well inside the first quantum

    mix_frames(&engine, 128);
    assert_eq!(engine.is_paused(handle), Some(true));

    // Paused voices produce silence
    let out = mix_frames(&engine, 128);
    assert!(out.iter().all(|&s| s == 0.0));

    // Resume: the consumed scheduler must not re-pause
    engine.set_pause(handle, false);
    mix_frames(&engine, 128);
    assert_eq!(engine.is_paused(handle), Some(false));
}

#[test]
fn scheduled_stop_kills_the_voice() {
    let engine = exact_engine(128);
    let mut source = mono(vec![0.3; 256]);
    source.params_mut().flags.looping = true;

    let handle = engine.play(&source).unwrap();
    engine.schedule_stop(handle, 0.001);
    mix_frames(&engine, 128);
    assert!(!engine.is_valid_voice_handle(handle));
}

#[test]
fn volume_change_ramps_across_the_quantum() {
    let engine = exact_engine(128);
    let mut source = mono(vec![0.5; 64]);
    source.params_mut().flags.looping = true;

    let handle = engine.play(&source).unwrap();
    let q1 = mix_frames(&engine, 128);
    let full = 0.5 * PAN;
    assert!((q1[0] - full).abs() < 1e-5);

    engine.set_volume(handle, 0.5);
    let q2 = mix_frames(&engine, 128);
    // First sample sits near the old gain, last at the new target, and
    // the left channel never jumps discontinuously in between
    assert!((q2[0] - full).abs() < 0.01, "clicked: {} vs {full}", q2[0]);
    let last = q2[126 * 2];
    assert!((last - full * 0.5).abs() < 0.01, "did not reach target: {last}");
    for i in 1..128 {
        let step = (q2[i * 2] - q2[(i - 1) * 2]).abs();
        assert!(step < 0.005, "gain step {step} at frame {i}");
    }
}

#[test]
fn voice_groups_apply_batch_operations_to_live_members() {
    let engine = exact_engine(64);
    let a = mono(vec![0.1; 4096]);
    let b = mono(vec![0.1; 4096]);

    let group = engine.create_voice_group().unwrap();
    assert!(engine.is_voice_group(group));
    assert!(engine.is_voice_group_empty(group));

    let ha = engine.play(&a).unwrap();
    let hb = engine.play(&b).unwrap();
    engine.add_voice_to_group(group, ha).unwrap();
    engine.add_voice_to_group(group, hb).unwrap();
    assert!(!engine.is_voice_group_empty(group));

    engine.set_volume(group, 0.25);
    assert_eq!(engine.volume(ha), Some(0.25));
    assert_eq!(engine.volume(hb), Some(0.25));

    engine.stop(ha);
    engine.set_pause(group, true);
    assert_eq!(engine.is_paused(hb), Some(true));

    engine.stop(hb);
    assert!(engine.is_voice_group_empty(group));
    assert!(engine.destroy_voice_group(group));
    assert!(!engine.is_voice_group(group));
}

#[test]
fn bus_routes_and_scales_its_children() {
    let engine = exact_engine(64);
    let bus = Bus::with_channels(44100.0, 2);
    let bus_handle = engine.play(&bus).unwrap();

    let mut source = mono(vec![0.4; 4096]);
    source.params_mut().flags.looping = true;
    let child = engine
        .play_ex(&source, None, 0.0, false, bus_handle)
        .unwrap();

    let out = mix_frames(&engine, 64);
    // Mono child panned into the stereo bus, bus panned into the output:
    // two center pan stages
    let expected = 0.4 * PAN * PAN;
    assert!((out[0] - expected).abs() < 1e-4, "got {}", out[0]);

    // Halving the bus volume scales the whole subtree
    engine.set_volume(bus_handle, 0.5);
    let out = mix_frames(&engine, 64);
    assert!((out[126] - expected * 0.5).abs() < 1e-3, "got {}", out[126]);

    // Killing the bus silences the child even though it still exists
    engine.stop(bus_handle);
    let out = mix_frames(&engine, 64);
    assert!(out.iter().all(|&s| s.abs() < 1e-6));
    assert!(engine.is_valid_voice_handle(child));
}

#[test]
fn play_clocked_aligns_starts_within_a_quantum() {
    let engine = exact_engine(128);
    let a = mono(vec![0.2; 4096]);
    let b = mono(vec![0.2; 4096]);

    let t0 = 10.0;
    engine.play_clocked(t0, &a).unwrap();
    engine.play_clocked(t0 + 64.0 / 44100.0, &b).unwrap();

    let out = mix_frames(&engine, 128);
    let one = 0.2 * PAN;
    // First 64 frames: only the first sound
    assert!((out[10 * 2] - one).abs() < 1e-4);
    // After the 64-frame offset both play
    assert!((out[100 * 2] - 2.0 * one).abs() < 1e-4, "got {}", out[100 * 2]);
}

#[test]
fn double_speed_point_resampling_skips_every_other_frame() {
    let engine = Engine::new(&EngineConfig {
        sample_rate: 44100,
        buffer_size: 16,
        channels: 2,
        max_active_voices: 16,
        resample_mode: ResampleMode::Point,
        clip_behavior: ClipBehavior::Hard,
        post_clip_scaler: 1.0,
    })
    .unwrap();

    let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
    let source = mono(data.clone());
    let handle = engine.play(&source).unwrap();
    engine.set_relative_play_speed(handle, 2.0).unwrap();

    let out = mix_frames(&engine, 16);
    for i in 0..16 {
        let expected = data[i * 2] * PAN;
        assert!(
            (out[i * 2] - expected).abs() < 1e-5,
            "frame {i}: {} != {expected}",
            out[i * 2]
        );
    }
}

#[test]
fn global_volume_fade_ramps_the_master() {
    let engine = exact_engine(128);
    let mut source = mono(vec![0.5; 64]);
    source.params_mut().flags.looping = true;
    engine.play(&source).unwrap();

    engine.set_global_volume(0.0);
    let out = mix_frames(&engine, 128);
    assert!(out.iter().all(|&s| s.abs() < 1e-6));

    engine.fade_global_volume(1.0, 128.0 / 44100.0);
    let out = mix_frames(&engine, 128);
    // Rising through the quantum, near full scale at the end
    assert!(out[0].abs() < 0.02);
    assert!(out[126 * 2] > 0.3, "got {}", out[126 * 2]);
    assert!((engine.global_volume() - 1.0).abs() < 1e-6);
}

#[test]
fn pause_all_silences_everything() {
    let engine = exact_engine(64);
    let mut source = mono(vec![0.5; 64]);
    source.params_mut().flags.looping = true;
    let handle = engine.play(&source).unwrap();

    engine.set_pause_all(true);
    let out = mix_frames(&engine, 64);
    assert!(out.iter().all(|&s| s == 0.0));

    engine.set_pause_all(false);
    let out = mix_frames(&engine, 64);
    assert!(out[0] != 0.0);
    assert_eq!(engine.is_paused(handle), Some(false));
}

#[test]
fn seek_repositions_an_in_memory_voice() {
    let engine = exact_engine(8);
    let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
    let source = mono(data.clone());
    let handle = engine.play(&source).unwrap();

    engine.seek(handle, 32.0 / 44100.0).unwrap();
    let out = mix_frames(&engine, 8);
    for i in 0..8 {
        let expected = data[32 + i] * PAN;
        assert!((out[i * 2] - expected).abs() < 1e-5, "frame {i}");
    }
}

#[test]
fn mix_signed16_converts_the_same_pipeline() {
    let engine = exact_engine(64);
    let mut source = mono(vec![0.5; 64]);
    source.params_mut().flags.looping = true;
    engine.play(&source).unwrap();

    let mut out = vec![0i16; 64 * 2];
    engine.mix_signed16(&mut out);
    let expected = (0.5 * PAN * i16::MAX as f32) as i16;
    assert!((out[0] - expected).abs() < 2, "got {} want {expected}", out[0]);
}

#[test]
fn spatial_voice_attenuates_with_distance() {
    let engine = exact_engine(64);
    let mut source = mono(vec![0.5; 4096]);
    source.params_mut().flags.looping = true;
    source.params_mut().spatial.attenuation = polymix_core::AttenuationModel::InverseDistance;
    source.params_mut().spatial.min_distance = 1.0;
    source.params_mut().spatial.rolloff_factor = 1.0;

    let handle = engine
        .play3d(&source, [0.0, 0.0, 1.0], [0.0, 0.0, 0.0])
        .unwrap();
    let near = engine.overall_volume(handle).unwrap();

    engine.set_3d_source_position(handle, [0.0, 0.0, 100.0]);
    engine.update_3d_audio();
    let far = engine.overall_volume(handle).unwrap();
    assert!(far < near * 0.05, "near {near}, far {far}");
}

#[test]
fn distance_delay_counts_output_frames() {
    let engine = exact_engine(64);
    let mut source = SampleBuffer::from_planar(vec![0.5; 2048], 22050.0, 1).unwrap();
    source.params_mut().flags.distance_delay = true;

    // 96 output frames of travel time at the engine rate; the source's
    // own 22.05 kHz rate must not halve the delay
    let distance = 343.0 * 96.0 / 44100.0;
    engine
        .play3d(&source, [0.0, 0.0, distance], [0.0, 0.0, 0.0])
        .unwrap();

    let q1 = mix_frames(&engine, 64);
    assert!(
        q1.iter().all(|&s| s == 0.0),
        "audible before the delay elapsed"
    );
    let q2 = mix_frames(&engine, 64);
    assert!(
        q2[63 * 2].abs() > 1e-3,
        "still silent after the delay: {}",
        q2[63 * 2]
    );
}

#[test]
fn protected_voices_survive_a_full_table() {
    let engine = exact_engine(64);
    let keeper = mono(vec![0.1; 1 << 16]);
    let filler = mono(vec![0.1; 1 << 16]);

    let protected = engine.play(&keeper).unwrap();
    engine.set_protect_voice(protected, true);
    // Flood the table so eviction has to happen
    for _ in 0..polymix_core::VOICE_COUNT + 8 {
        engine.play(&filler).unwrap();
    }
    assert!(engine.is_valid_voice_handle(protected));
    assert_eq!(engine.voice_count(), polymix_core::VOICE_COUNT);
}

#[test]
fn mock_backend_renders_blocks() {
    let engine = Arc::new(exact_engine(64));
    let mut source = mono(vec![0.25; 64]);
    source.params_mut().flags.looping = true;
    engine.play(&source).unwrap();

    let mut backend = MockBackend::new(Arc::clone(&engine), 64);
    let block = backend.render();
    assert_eq!(block.len(), 64 * 2);
    assert!((block[0] - 0.25 * PAN).abs() < 1e-5);
}

#[test]
fn primary_handle_is_not_a_voice() {
    let engine = exact_engine(64);
    assert!(!engine.is_valid_voice_handle(Handle::PRIMARY));
    assert!(!Handle::PRIMARY.is_group());
}
