//! Engine core: voice table, playback lifecycle, control surface
//!
//! One `parking_lot::Mutex` guards all mutable voice state. Control
//! methods lock per call; `mix` locks for the whole quantum. Voice
//! construction (and its allocations) happens before the lock is taken,
//! and voices dropped under the lock are deferred to the GC thread, so
//! the audio thread neither allocates nor frees in steady state.

use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::Owned;
use parking_lot::Mutex;

use crate::buffer::{interleave_f32, interleave_i16, AlignedFloatBuffer};
use crate::config::EngineConfig;
use crate::engine::gc::gc_handle;
use crate::engine::spatial::{SpatialState, SpatialVoice};
use crate::error::{EngineError, EngineResult};
use crate::fader::Fader;
use crate::filter::Filter;
use crate::handle::{Handle, VoiceGroups, MAX_PLAY_INDEX};
use crate::source::{AudioSource, ListenerParams, SeekFlags, VoiceOutput};
use crate::types::{
    ClipBehavior, ResampleMode, Sample, DEFAULT_SOUND_SPEED, FILTERS_PER_STREAM, MAX_CHANNELS,
    SAMPLE_GRANULARITY, VOICE_COUNT,
};
use crate::voice::Voice;

use std::sync::Arc;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Ping-pong block pair for one mixed voice. `prev` keeps the previous
/// fetch so interpolating resamplers can look behind the cursor.
#[derive(Default)]
pub(crate) struct ResamplePair {
    pub curr: AlignedFloatBuffer,
    pub prev: AlignedFloatBuffer,
}

impl ResamplePair {
    fn new() -> Self {
        Self {
            curr: AlignedFloatBuffer::new(SAMPLE_GRANULARITY * MAX_CHANNELS),
            prev: AlignedFloatBuffer::new(SAMPLE_GRANULARITY * MAX_CHANNELS),
        }
    }

    pub fn clear(&mut self) {
        self.curr.clear();
        self.prev.clear();
    }
}

/// Generation check: does this handle still refer to a live voice?
pub(crate) fn slot_for(voices: &[Option<Owned<Voice>>], handle: Handle) -> Option<usize> {
    let slot = handle.slot()?;
    let voice = voices.get(slot)?.as_ref()?;
    (voice.play_index == handle.play_index()).then_some(slot)
}

/// All mutable engine state, guarded by the audio mutex
pub(crate) struct EngineInner {
    pub engine_id: u64,
    pub sample_rate: f32,
    pub buffer_size: usize,
    pub channels: usize,
    /// Row stride of the planar scratch buffers
    pub scratch_frames: usize,
    pub global_volume: f32,
    pub global_volume_fader: Fader,
    pub post_clip_scaler: f32,
    pub clip_behavior: ClipBehavior,
    pub resample_mode: ResampleMode,
    /// Seconds of audio mixed since engine start
    pub stream_time: f64,
    /// Clock anchor for `play_clocked`
    pub last_clocked_time: f64,
    /// Monotonic play counter; wraps before 20 bits
    pub play_index: u32,
    /// One past the highest occupied voice slot
    pub highest_voice: usize,
    pub voices: Vec<Option<Owned<Voice>>>,
    pub max_active_voices: usize,
    /// Slots selected by the last triage, prefix = must-tick voices
    pub active_voices: Vec<usize>,
    pub active_voice_count: usize,
    pub active_voice_dirty: bool,
    pub resample_pool: Vec<ResamplePair>,
    /// Which voice slot owns each pool entry
    pub pool_owner: Vec<Option<usize>>,
    /// Per-voice resample output rows during mixing, clip output after
    pub scratch: AlignedFloatBuffer,
    /// Master bus accumulation rows
    pub output_scratch: AlignedFloatBuffer,
    /// Spare block pair for advancing inaudible must-tick voices that
    /// hold no pool entry; contents are discarded
    pub tick_pair: ResamplePair,
    pub global_filters: [Option<Arc<dyn Filter>>; FILTERS_PER_STREAM],
    pub global_filter_instances: [Option<Box<dyn FilterInstance>>; FILTERS_PER_STREAM],
    pub groups: VoiceGroups,
}

use crate::filter::FilterInstance;

impl EngineInner {
    fn new(engine_id: u64, config: &EngineConfig) -> Self {
        let mut inner = Self {
            engine_id,
            sample_rate: config.sample_rate as f32,
            buffer_size: 0,
            channels: config.channels,
            scratch_frames: 0,
            global_volume: 1.0,
            global_volume_fader: Fader::new(),
            post_clip_scaler: config.post_clip_scaler,
            clip_behavior: config.clip_behavior,
            resample_mode: config.resample_mode,
            stream_time: 0.0,
            last_clocked_time: 0.0,
            play_index: 0,
            highest_voice: 0,
            voices: (0..VOICE_COUNT).map(|_| None).collect(),
            max_active_voices: config.max_active_voices,
            active_voices: vec![0; VOICE_COUNT],
            active_voice_count: 0,
            active_voice_dirty: true,
            resample_pool: Vec::new(),
            pool_owner: Vec::new(),
            scratch: AlignedFloatBuffer::default(),
            output_scratch: AlignedFloatBuffer::default(),
            tick_pair: ResamplePair::default(),
            global_filters: std::array::from_fn(|_| None),
            global_filter_instances: std::array::from_fn(|_| None),
            groups: VoiceGroups::default(),
        };
        inner.configure(config.sample_rate as f32, config.buffer_size, config.channels);
        inner
    }

    /// (Re-)allocate mixing buffers for the given output format.
    /// Called at construction and from `post_init` once the backend
    /// reports its real format; never from the audio thread.
    pub fn configure(&mut self, sample_rate: f32, buffer_size: usize, channels: usize) {
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        self.channels = channels;
        self.scratch_frames = buffer_size.max(SAMPLE_GRANULARITY);
        self.scratch = AlignedFloatBuffer::new(self.scratch_frames * MAX_CHANNELS);
        self.output_scratch = AlignedFloatBuffer::new(self.scratch_frames * MAX_CHANNELS);
        self.tick_pair = ResamplePair::new();
        self.rebuild_pool();
    }

    fn rebuild_pool(&mut self) {
        self.resample_pool = (0..self.max_active_voices).map(|_| ResamplePair::new()).collect();
        self.pool_owner = vec![None; self.max_active_voices];
        for voice in self.voices.iter_mut().flatten() {
            voice.pool_slot = None;
        }
        self.active_voice_dirty = true;
    }

    pub fn voice_slot(&self, handle: Handle) -> Option<usize> {
        slot_for(&self.voices, handle)
    }

    /// Apply `f` to the voice (or every live group member) behind `handle`
    pub fn with_voices<F: FnMut(&mut Voice)>(&mut self, handle: Handle, mut f: F) {
        if handle.is_group() {
            let voices = &self.voices;
            let members: Vec<Handle> = self
                .groups
                .members_trimmed(handle, |h| slot_for(voices, h).is_some())
                .map(<[Handle]>::to_vec)
                .unwrap_or_default();
            for member in members {
                if let Some(slot) = slot_for(&self.voices, member) {
                    if let Some(voice) = self.voices[slot].as_mut() {
                        f(voice);
                    }
                }
            }
        } else if let Some(slot) = self.voice_slot(handle) {
            if let Some(voice) = self.voices[slot].as_mut() {
                f(voice);
            }
        }
    }

    /// Slots addressed by `handle` (one voice, or a group snapshot)
    fn resolve_slots(&mut self, handle: Handle) -> Vec<usize> {
        if handle.is_group() {
            let voices = &self.voices;
            self.groups
                .members_trimmed(handle, |h| slot_for(voices, h).is_some())
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|&h| slot_for(voices, h))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            self.voice_slot(handle).into_iter().collect()
        }
    }

    /// Find a slot for a new voice, evicting the oldest non-protected
    /// voice if the table is full
    fn find_free_voice(&mut self) -> EngineResult<usize> {
        let mut lowest_play_index = u32::MAX;
        let mut lowest_slot = None;
        for i in 0..VOICE_COUNT {
            match &self.voices[i] {
                None => return Ok(i),
                Some(v) => {
                    if !v.flags.protected && v.play_index < lowest_play_index {
                        lowest_play_index = v.play_index;
                        lowest_slot = Some(i);
                    }
                }
            }
        }
        match lowest_slot {
            Some(slot) => {
                log::debug!("voice table full, evicting oldest voice in slot {slot}");
                self.stop_voice_internal(slot);
                Ok(slot)
            }
            None => Err(EngineError::InvalidParameter(
                "voice table full and every voice is protected",
            )),
        }
    }

    /// Install a constructed voice and hand out its handle
    fn start_voice(&mut self, mut voice: Voice, paused: bool) -> EngineResult<Handle> {
        let slot = self.find_free_voice()?;
        let play_index = self.play_index;
        self.play_index = (self.play_index + 1) % MAX_PLAY_INDEX;
        voice.play_index = play_index;
        voice.flags.paused = paused;
        let handle = Handle::from_slot(slot, play_index);
        if let VoiceOutput::Bus(state) = &mut voice.output {
            state.channel = handle;
        }
        self.voices[slot] = Some(Owned::new(&gc_handle(), voice));
        if slot + 1 > self.highest_voice {
            self.highest_voice = slot + 1;
        }
        self.active_voice_dirty = true;
        Ok(handle)
    }

    /// Stop a voice by slot: swap the slot empty first, then let the
    /// deferred drop reclaim the state off the audio thread
    pub fn stop_voice_internal(&mut self, slot: usize) {
        if let Some(voice) = self.voices[slot].take() {
            if let Some(pool) = voice.pool_slot {
                self.pool_owner[pool] = None;
            }
            self.active_voice_dirty = true;
            drop(voice);
        }
        while self.highest_voice > 0 && self.voices[self.highest_voice - 1].is_none() {
            self.highest_voice -= 1;
        }
    }

    pub fn stop_handle(&mut self, handle: Handle) {
        for slot in self.resolve_slots(handle) {
            self.stop_voice_internal(slot);
        }
    }

    pub fn stop_by_source_id(&mut self, source_id: u32) {
        for slot in 0..self.highest_voice {
            if self.voices[slot]
                .as_ref()
                .is_some_and(|v| v.source_id == source_id)
            {
                self.stop_voice_internal(slot);
            }
        }
    }

    /// Apply one 3D pass result to the live voice
    pub fn commit_3d(
        &mut self,
        handle: Handle,
        volume: f32,
        doppler: f32,
        channel_volume: [f32; MAX_CHANNELS],
    ) {
        let mut dirty = false;
        if let Some(slot) = self.voice_slot(handle) {
            if let Some(voice) = self.voices[slot].as_mut() {
                voice.volume_3d = volume;
                dirty = voice.recompute_volume();
                voice.doppler = doppler;
                voice.overall_relative_play_speed = voice.set_relative_play_speed * doppler;
                voice.channel_volume = channel_volume;
            }
        }
        if dirty {
            self.active_voice_dirty = true;
        }
    }
}

#[derive(Default)]
struct PlayOpts {
    volume: Option<f32>,
    pan: f32,
    pan_absolute: Option<(f32, f32)>,
    paused: bool,
    bus: Handle,
    /// Caller-supplied clock for sub-quantum start alignment
    clock: Option<f64>,
    force_3d: bool,
}

/// The mixing engine.
///
/// Thread-safe by construction: every method takes `&self` and locks
/// internally, so an `Arc<Engine>` can be shared between the audio
/// callback and any number of control threads.
pub struct Engine {
    id: u64,
    inner: Mutex<EngineInner>,
    data3d: Mutex<SpatialState>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "engine {id}: {} channels @ {} Hz, quantum {} frames, {} active voices",
            config.channels,
            config.sample_rate,
            config.buffer_size,
            config.max_active_voices
        );
        Ok(Self {
            id,
            inner: Mutex::new(EngineInner::new(id, config)),
            data3d: Mutex::new(SpatialState::new(config.channels, DEFAULT_SOUND_SPEED)),
        })
    }

    /// Adopt the output format the backend actually negotiated.
    /// Reallocates mixing buffers; do not call from the audio callback.
    pub fn post_init(
        &self,
        sample_rate: f32,
        buffer_size: usize,
        channels: usize,
    ) -> EngineResult<()> {
        if sample_rate <= 0.0 || buffer_size == 0 || !matches!(channels, 1 | 2 | 4 | 6 | 8) {
            return Err(EngineError::InvalidParameter("invalid output format"));
        }
        self.inner.lock().configure(sample_rate, buffer_size, channels);
        self.data3d.lock().set_default_speakers(channels);
        log::info!(
            "engine {}: output reconfigured to {channels} channels @ {sample_rate} Hz",
            self.id
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------

    /// Play a source on the primary bus at its default volume
    pub fn play(&self, source: &dyn AudioSource) -> EngineResult<Handle> {
        self.play_internal(source, PlayOpts::default())
    }

    /// Play a source, initially paused
    pub fn play_paused(&self, source: &dyn AudioSource) -> EngineResult<Handle> {
        self.play_internal(
            source,
            PlayOpts {
                paused: true,
                ..Default::default()
            },
        )
    }

    /// Play with explicit volume, pan, pause state and target bus.
    /// `volume: None` uses the source's default volume; `bus` is a handle
    /// returned by playing a `Bus`, or `Handle::PRIMARY`.
    pub fn play_ex(
        &self,
        source: &dyn AudioSource,
        volume: Option<f32>,
        pan: f32,
        paused: bool,
        bus: Handle,
    ) -> EngineResult<Handle> {
        self.play_internal(
            source,
            PlayOpts {
                volume,
                pan,
                paused,
                bus,
                ..Default::default()
            },
        )
    }

    /// Play aligned to a caller-provided clock: successive calls with
    /// increasing timestamps get sample-accurate start offsets even when
    /// several sounds are triggered within one mix quantum.
    pub fn play_clocked(&self, time: f64, source: &dyn AudioSource) -> EngineResult<Handle> {
        self.play_internal(
            source,
            PlayOpts {
                clock: Some(time),
                ..Default::default()
            },
        )
    }

    /// Play ignoring panning: every output channel gets full gain
    pub fn play_background(&self, source: &dyn AudioSource) -> EngineResult<Handle> {
        self.play_internal(
            source,
            PlayOpts {
                pan_absolute: Some((1.0, 1.0)),
                ..Default::default()
            },
        )
    }

    /// Play a source at a position in 3D space
    pub fn play3d(
        &self,
        source: &dyn AudioSource,
        position: [f32; 3],
        velocity: [f32; 3],
    ) -> EngineResult<Handle> {
        self.play3d_ex(source, position, velocity, None, false, Handle::PRIMARY)
    }

    pub fn play3d_ex(
        &self,
        source: &dyn AudioSource,
        position: [f32; 3],
        velocity: [f32; 3],
        volume: Option<f32>,
        paused: bool,
        bus: Handle,
    ) -> EngineResult<Handle> {
        self.play3d_internal(source, position, velocity, volume, paused, bus, None)
    }

    /// `play_clocked` in 3D space
    pub fn play3d_clocked(
        &self,
        time: f64,
        source: &dyn AudioSource,
        position: [f32; 3],
        velocity: [f32; 3],
    ) -> EngineResult<Handle> {
        self.play3d_internal(source, position, velocity, None, false, Handle::PRIMARY, Some(time))
    }

    fn play_internal(&self, source: &dyn AudioSource, opts: PlayOpts) -> EngineResult<Handle> {
        let params = source.params();
        params.bind_engine(self.id)?;
        // Voice construction allocates; keep it outside the lock
        let output = source.create_voice()?;
        let mut voice = Voice::new(output, params, opts.bus);
        if opts.force_3d {
            voice.flags.process_3d = true;
        }
        voice.set_volume = opts.volume.unwrap_or(params.volume);
        match opts.pan_absolute {
            Some((l, r)) => voice.set_pan_absolute(l, r),
            None => voice.set_pan(opts.pan),
        }
        voice.recompute_volume();
        voice.seed_channel_ramp();

        let mut inner = self.inner.lock();
        if params.flags.single_instance {
            inner.stop_by_source_id(params.id());
        }
        if let Some(time) = opts.clock {
            if inner.last_clocked_time == 0.0 {
                inner.last_clocked_time = time;
            }
            voice.delay_samples = ((time - inner.last_clocked_time).max(0.0)
                * f64::from(inner.sample_rate))
            .round() as usize;
        }
        inner.start_voice(voice, opts.paused)
    }

    fn play3d_internal(
        &self,
        source: &dyn AudioSource,
        position: [f32; 3],
        velocity: [f32; 3],
        volume: Option<f32>,
        paused: bool,
        bus: Handle,
        clock: Option<f64>,
    ) -> EngineResult<Handle> {
        let params = source.params();
        // Start paused so the first 3D result is in place before the
        // voice becomes audible
        let handle = self.play_internal(
            source,
            PlayOpts {
                volume,
                bus,
                clock,
                paused: true,
                force_3d: true,
                ..Default::default()
            },
        )?;
        let slot = handle.slot().ok_or(EngineError::InvalidParameter("bad voice handle"))?;

        let (result, delay_seconds) = {
            let mut data3d = self.data3d.lock();
            let mut sv = SpatialVoice::new(handle, &params.spatial, &params.flags, position, velocity);
            let distance = data3d.listener_distance(&sv);
            data3d.compute(&mut sv);
            let result = (sv.out_volume, sv.out_doppler, sv.out_channel_volume);
            let delay = params
                .flags
                .distance_delay
                .then(|| f64::from(distance / data3d.sound_speed));
            data3d.voices[slot] = Some(sv);
            (result, delay)
        };

        let mut inner = self.inner.lock();
        inner.commit_3d(handle, result.0, result.1, result.2);
        // delay_samples counts output frames, so convert at the engine rate
        let output_rate = f64::from(inner.sample_rate);
        let mut dirty = false;
        inner.with_voices(handle, |v| {
            v.seed_channel_ramp();
            if let Some(seconds) = delay_seconds {
                v.delay_samples = (seconds * output_rate) as usize;
            }
            if !paused {
                v.flags.paused = false;
                dirty = true;
            }
        });
        if dirty {
            inner.active_voice_dirty = true;
        }
        Ok(handle)
    }

    // -----------------------------------------------------------------
    // Mixing entry points
    // -----------------------------------------------------------------

    /// Mix interleaved f32 output; `buffer.len()` must be a multiple of
    /// the channel count. Larger requests are processed in quantum-sized
    /// chunks.
    pub fn mix(&self, buffer: &mut [Sample]) {
        let mut inner = self.inner.lock();
        let channels = inner.channels;
        let chunk_len = inner.buffer_size * channels;
        for chunk in buffer.chunks_mut(chunk_len) {
            let frames = chunk.len() / channels;
            let mixed = inner.mix_internal(frames);
            interleave_f32(inner.scratch.as_slice(), chunk, mixed, inner.scratch_frames, channels);
        }
    }

    /// Mix interleaved signed 16-bit output
    pub fn mix_signed16(&self, buffer: &mut [i16]) {
        let mut inner = self.inner.lock();
        let channels = inner.channels;
        let chunk_len = inner.buffer_size * channels;
        for chunk in buffer.chunks_mut(chunk_len) {
            let frames = chunk.len() / channels;
            let mixed = inner.mix_internal(frames);
            interleave_i16(inner.scratch.as_slice(), chunk, mixed, inner.scratch_frames, channels);
        }
    }

    // -----------------------------------------------------------------
    // Voice control
    // -----------------------------------------------------------------

    pub fn set_volume(&self, handle: Handle, volume: f32) {
        let mut inner = self.inner.lock();
        let mut dirty = false;
        inner.with_voices(handle, |v| {
            v.set_volume = volume;
            dirty |= v.recompute_volume();
        });
        if dirty {
            inner.active_voice_dirty = true;
        }
    }

    pub fn fade_volume(&self, handle: Handle, to: f32, time: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let from = v.set_volume;
            let start = v.stream_time;
            v.volume_fader.set(from, to, time, start);
        });
    }

    pub fn oscillate_volume(&self, handle: Handle, from: f32, to: f32, period: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let start = v.stream_time;
            v.volume_fader.set_lfo(from, to, period, start);
        });
    }

    pub fn set_pan(&self, handle: Handle, pan: f32) {
        self.inner.lock().with_voices(handle, |v| v.set_pan(pan));
    }

    /// Set explicit left/right gains, bypassing the pan law
    pub fn set_pan_absolute(&self, handle: Handle, left: f32, right: f32) {
        self.inner
            .lock()
            .with_voices(handle, |v| v.set_pan_absolute(left, right));
    }

    pub fn fade_pan(&self, handle: Handle, to: f32, time: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let from = v.pan;
            let start = v.stream_time;
            v.pan_fader.set(from, to, time, start);
        });
    }

    pub fn oscillate_pan(&self, handle: Handle, from: f32, to: f32, period: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let start = v.stream_time;
            v.pan_fader.set_lfo(from, to, period, start);
        });
    }

    /// Playback speed multiplier; must be positive
    pub fn set_relative_play_speed(&self, handle: Handle, speed: f32) -> EngineResult<()> {
        if speed <= 0.0 {
            return Err(EngineError::InvalidParameter(
                "relative play speed must be positive",
            ));
        }
        self.inner.lock().with_voices(handle, |v| {
            v.set_relative_play_speed = speed;
            v.overall_relative_play_speed = speed * v.doppler;
        });
        Ok(())
    }

    pub fn fade_relative_play_speed(&self, handle: Handle, to: f32, time: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let from = v.set_relative_play_speed;
            let start = v.stream_time;
            v.relative_play_speed_fader.set(from, to, time, start);
        });
    }

    pub fn oscillate_relative_play_speed(&self, handle: Handle, from: f32, to: f32, period: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let start = v.stream_time;
            v.relative_play_speed_fader.set_lfo(from, to, period, start);
        });
    }

    /// Override the voice's notion of its source sample rate
    pub fn set_samplerate(&self, handle: Handle, sample_rate: f32) -> EngineResult<()> {
        if sample_rate <= 0.0 {
            return Err(EngineError::InvalidParameter("sample rate must be positive"));
        }
        self.inner
            .lock()
            .with_voices(handle, |v| v.base_sample_rate = sample_rate);
        Ok(())
    }

    pub fn set_looping(&self, handle: Handle, looping: bool) {
        self.inner.lock().with_voices(handle, |v| v.flags.looping = looping);
    }

    pub fn set_loop_point(&self, handle: Handle, seconds: f64) {
        self.inner.lock().with_voices(handle, |v| v.loop_point = seconds);
    }

    /// Protected voices are never evicted by a full voice table
    pub fn set_protect_voice(&self, handle: Handle, protect: bool) {
        self.inner.lock().with_voices(handle, |v| v.flags.protected = protect);
    }

    pub fn set_pause(&self, handle: Handle, pause: bool) {
        let mut inner = self.inner.lock();
        inner.with_voices(handle, |v| v.flags.paused = pause);
        inner.active_voice_dirty = true;
    }

    pub fn set_pause_all(&self, pause: bool) {
        let mut inner = self.inner.lock();
        for voice in inner.voices.iter_mut().flatten() {
            voice.flags.paused = pause;
        }
        inner.active_voice_dirty = true;
    }

    /// What to do when a voice's overall volume drops below audibility:
    /// keep advancing it (`must_tick`) and/or stop it outright (`kill`)
    pub fn set_inaudible_behavior(&self, handle: Handle, must_tick: bool, kill: bool) {
        let mut inner = self.inner.lock();
        inner.with_voices(handle, |v| {
            v.flags.tick_when_inaudible = must_tick;
            v.flags.kill_when_inaudible = kill;
        });
        inner.active_voice_dirty = true;
    }

    /// Postpone audible output by `samples` output frames
    pub fn set_delay_samples(&self, handle: Handle, samples: usize) {
        self.inner.lock().with_voices(handle, |v| v.delay_samples = samples);
    }

    /// Pause the voice after `time` seconds of its stream time
    pub fn schedule_pause(&self, handle: Handle, time: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let start = v.stream_time;
            v.pause_scheduler.set(1.0, 0.0, time, start);
        });
    }

    /// Stop the voice after `time` seconds of its stream time
    pub fn schedule_stop(&self, handle: Handle, time: f64) {
        self.inner.lock().with_voices(handle, |v| {
            let start = v.stream_time;
            v.stop_scheduler.set(1.0, 0.0, time, start);
        });
    }

    pub fn stop(&self, handle: Handle) {
        self.inner.lock().stop_handle(handle);
    }

    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        for slot in 0..VOICE_COUNT {
            inner.stop_voice_internal(slot);
        }
    }

    /// Stop every voice of this source. Call before dropping a source
    /// that may still be playing.
    pub fn stop_audio_source(&self, source: &dyn AudioSource) {
        self.inner.lock().stop_by_source_id(source.params().id());
    }

    /// Number of live voices playing this source
    pub fn count_audio_source(&self, source: &dyn AudioSource) -> usize {
        let inner = self.inner.lock();
        let id = source.params().id();
        inner
            .voices
            .iter()
            .take(inner.highest_voice)
            .flatten()
            .filter(|v| v.source_id == id)
            .count()
    }

    /// Reposition a voice (seconds). Streaming sources seek
    /// asynchronously and report an estimated position.
    pub fn seek(&self, handle: Handle, seconds: f64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let slots = inner.resolve_slots(handle);
        let mut scratch = std::mem::take(&mut inner.scratch);
        let mut result = Ok(());
        for slot in slots {
            if let Some(voice) = inner.voices[slot].as_mut() {
                let rate = f64::from(voice.base_sample_rate);
                let frames = (seconds.max(0.0) * rate).round() as u64;
                match &mut voice.output {
                    VoiceOutput::Stream(stream) => {
                        match stream.seek(frames, scratch.as_mut_slice(), SeekFlags::default()) {
                            Ok(reached) => {
                                voice.stream_position = reached.position as f64 / rate;
                                // Restarting the voice clock lets active
                                // faders recover via rollover
                                voice.stream_time = voice.stream_position;
                                voice.reset_blocks();
                            }
                            Err(e) => result = Err(e),
                        }
                    }
                    VoiceOutput::Bus(_) => {
                        result = Err(EngineError::InvalidParameter("cannot seek a bus"))
                    }
                }
            }
        }
        inner.scratch = scratch;
        result
    }

    // -----------------------------------------------------------------
    // Voice queries
    // -----------------------------------------------------------------

    fn read_voice<T>(&self, handle: Handle, f: impl FnOnce(&Voice) -> T) -> Option<T> {
        let inner = self.inner.lock();
        let slot = inner.voice_slot(handle)?;
        inner.voices[slot].as_ref().map(|v| f(v))
    }

    pub fn is_valid_voice_handle(&self, handle: Handle) -> bool {
        self.inner.lock().voice_slot(handle).is_some()
    }

    pub fn volume(&self, handle: Handle) -> Option<f32> {
        self.read_voice(handle, |v| v.set_volume)
    }

    /// Volume after 3D attenuation, as used by the triage
    pub fn overall_volume(&self, handle: Handle) -> Option<f32> {
        self.read_voice(handle, |v| v.overall_volume)
    }

    pub fn pan(&self, handle: Handle) -> Option<f32> {
        self.read_voice(handle, |v| v.pan)
    }

    pub fn relative_play_speed(&self, handle: Handle) -> Option<f32> {
        self.read_voice(handle, |v| v.set_relative_play_speed)
    }

    pub fn samplerate(&self, handle: Handle) -> Option<f32> {
        self.read_voice(handle, |v| v.base_sample_rate)
    }

    pub fn is_looping(&self, handle: Handle) -> Option<bool> {
        self.read_voice(handle, |v| v.flags.looping)
    }

    pub fn loop_point(&self, handle: Handle) -> Option<f64> {
        self.read_voice(handle, |v| v.loop_point)
    }

    pub fn loop_count(&self, handle: Handle) -> Option<u32> {
        self.read_voice(handle, |v| v.loop_count)
    }

    pub fn is_paused(&self, handle: Handle) -> Option<bool> {
        self.read_voice(handle, |v| v.flags.paused)
    }

    pub fn is_protected(&self, handle: Handle) -> Option<bool> {
        self.read_voice(handle, |v| v.flags.protected)
    }

    /// Seconds the voice has been playing (unpaused)
    pub fn voice_stream_time(&self, handle: Handle) -> Option<f64> {
        self.read_voice(handle, |v| v.stream_time)
    }

    /// Position within the source, seconds
    pub fn stream_position(&self, handle: Handle) -> Option<f64> {
        self.read_voice(handle, |v| v.stream_position)
    }

    /// Number of live voices
    pub fn voice_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.voices.iter().take(inner.highest_voice).flatten().count()
    }

    /// Number of voices the next quantum will actually mix or tick
    pub fn active_voice_count(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.active_voice_dirty {
            inner.calc_active_voices();
        }
        inner.active_voice_count
    }

    // -----------------------------------------------------------------
    // Global parameters
    // -----------------------------------------------------------------

    pub fn set_global_volume(&self, volume: f32) {
        let mut inner = self.inner.lock();
        inner.global_volume_fader.disable();
        inner.global_volume = volume;
    }

    pub fn global_volume(&self) -> f32 {
        self.inner.lock().global_volume
    }

    pub fn fade_global_volume(&self, to: f32, time: f64) {
        let mut inner = self.inner.lock();
        let from = inner.global_volume;
        let start = inner.stream_time;
        inner.global_volume_fader.set(from, to, time, start);
    }

    pub fn set_post_clip_scaler(&self, scaler: f32) {
        self.inner.lock().post_clip_scaler = scaler;
    }

    pub fn post_clip_scaler(&self) -> f32 {
        self.inner.lock().post_clip_scaler
    }

    pub fn set_clip_behavior(&self, behavior: ClipBehavior) {
        self.inner.lock().clip_behavior = behavior;
    }

    pub fn set_resample_mode(&self, mode: ResampleMode) {
        self.inner.lock().resample_mode = mode;
    }

    /// Seconds of audio mixed since engine start
    pub fn stream_time(&self) -> f64 {
        self.inner.lock().stream_time
    }

    pub fn sample_rate(&self) -> f32 {
        self.inner.lock().sample_rate
    }

    pub fn channels(&self) -> usize {
        self.inner.lock().channels
    }

    /// Mix quantum, frames
    pub fn buffer_size(&self) -> usize {
        self.inner.lock().buffer_size
    }

    pub fn max_active_voices(&self) -> usize {
        self.inner.lock().max_active_voices
    }

    /// Resize the mixed-voice budget; reallocates the resample pool
    pub fn set_max_active_voices(&self, count: usize) -> EngineResult<()> {
        if count == 0 || count > VOICE_COUNT {
            return Err(EngineError::InvalidParameter("max_active_voices out of range"));
        }
        let mut inner = self.inner.lock();
        inner.max_active_voices = count;
        inner.rebuild_pool();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------

    /// Install a filter on one of the global (post-mix) filter slots
    pub fn set_global_filter(
        &self,
        slot: usize,
        filter: Option<Arc<dyn Filter>>,
    ) -> EngineResult<()> {
        if slot >= FILTERS_PER_STREAM {
            return Err(EngineError::InvalidParameter("filter slot out of range"));
        }
        let mut inner = self.inner.lock();
        inner.global_filter_instances[slot] = filter.as_ref().map(|f| f.create_instance());
        inner.global_filters[slot] = filter;
        Ok(())
    }

    /// Set a filter parameter on a voice's filter slot, or on a global
    /// slot when `handle` is `Handle::PRIMARY`
    pub fn set_filter_parameter(&self, handle: Handle, slot: usize, attribute: u32, value: f32) {
        if slot >= FILTERS_PER_STREAM {
            return;
        }
        let mut inner = self.inner.lock();
        if handle == Handle::PRIMARY {
            if let Some(instance) = inner.global_filter_instances[slot].as_mut() {
                instance.set_filter_parameter(attribute, value);
            }
        } else {
            inner.with_voices(handle, |v| {
                if let Some(instance) = v.filters[slot].as_mut() {
                    instance.set_filter_parameter(attribute, value);
                }
            });
        }
    }

    pub fn get_filter_parameter(&self, handle: Handle, slot: usize, attribute: u32) -> Option<f32> {
        if slot >= FILTERS_PER_STREAM {
            return None;
        }
        let mut inner = self.inner.lock();
        if handle == Handle::PRIMARY {
            return inner.global_filter_instances[slot]
                .as_ref()
                .map(|i| i.get_filter_parameter(attribute));
        }
        let mut value = None;
        inner.with_voices(handle, |v| {
            if value.is_none() {
                value = v.filters[slot]
                    .as_ref()
                    .map(|i| i.get_filter_parameter(attribute));
            }
        });
        value
    }

    pub fn fade_filter_parameter(
        &self,
        handle: Handle,
        slot: usize,
        attribute: u32,
        to: f32,
        time: f64,
    ) {
        if slot >= FILTERS_PER_STREAM {
            return;
        }
        let mut inner = self.inner.lock();
        if handle == Handle::PRIMARY {
            let start = inner.stream_time;
            if let Some(instance) = inner.global_filter_instances[slot].as_mut() {
                instance.fade_filter_parameter(attribute, to, time, start);
            }
        } else {
            inner.with_voices(handle, |v| {
                let start = v.stream_time;
                if let Some(instance) = v.filters[slot].as_mut() {
                    instance.fade_filter_parameter(attribute, to, time, start);
                }
            });
        }
    }

    pub fn oscillate_filter_parameter(
        &self,
        handle: Handle,
        slot: usize,
        attribute: u32,
        from: f32,
        to: f32,
        period: f64,
    ) {
        if slot >= FILTERS_PER_STREAM {
            return;
        }
        let mut inner = self.inner.lock();
        if handle == Handle::PRIMARY {
            let start = inner.stream_time;
            if let Some(instance) = inner.global_filter_instances[slot].as_mut() {
                instance.oscillate_filter_parameter(attribute, from, to, period, start);
            }
        } else {
            inner.with_voices(handle, |v| {
                let start = v.stream_time;
                if let Some(instance) = v.filters[slot].as_mut() {
                    instance.oscillate_filter_parameter(attribute, from, to, period, start);
                }
            });
        }
    }

    // -----------------------------------------------------------------
    // Voice groups
    // -----------------------------------------------------------------

    /// Create a voice group; batch operations on its handle address every
    /// live member
    pub fn create_voice_group(&self) -> EngineResult<Handle> {
        self.inner
            .lock()
            .groups
            .create()
            .ok_or(EngineError::OutOfMemory("voice group table full"))
    }

    /// Destroy a group; member voices keep playing
    pub fn destroy_voice_group(&self, handle: Handle) -> bool {
        self.inner.lock().groups.destroy(handle)
    }

    pub fn add_voice_to_group(&self, group: Handle, voice: Handle) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if inner.voice_slot(voice).is_none() {
            return Err(EngineError::InvalidParameter("stale voice handle"));
        }
        if inner.groups.add(group, voice) {
            Ok(())
        } else {
            Err(EngineError::InvalidParameter("no such voice group"))
        }
    }

    pub fn is_voice_group(&self, handle: Handle) -> bool {
        self.inner.lock().groups.exists(handle)
    }

    /// True when the group has no live members left
    pub fn is_voice_group_empty(&self, handle: Handle) -> bool {
        handle.is_group() && self.inner.lock().resolve_slots(handle).is_empty()
    }

    // -----------------------------------------------------------------
    // 3D audio
    // -----------------------------------------------------------------

    pub fn set_3d_listener_parameters(&self, listener: ListenerParams) {
        self.data3d.lock().listener = listener;
    }

    pub fn set_3d_listener_position(&self, position: [f32; 3]) {
        self.data3d.lock().listener.position = position;
    }

    pub fn set_3d_listener_at(&self, at: [f32; 3]) {
        self.data3d.lock().listener.at = at;
    }

    pub fn set_3d_listener_up(&self, up: [f32; 3]) {
        self.data3d.lock().listener.up = up;
    }

    pub fn set_3d_listener_velocity(&self, velocity: [f32; 3]) {
        self.data3d.lock().listener.velocity = velocity;
    }

    pub fn set_3d_sound_speed(&self, speed: f32) -> EngineResult<()> {
        if speed <= 0.0 {
            return Err(EngineError::InvalidParameter("sound speed must be positive"));
        }
        self.data3d.lock().sound_speed = speed;
        Ok(())
    }

    pub fn get_3d_sound_speed(&self) -> f32 {
        self.data3d.lock().sound_speed
    }

    pub fn set_3d_source_parameters(&self, handle: Handle, position: [f32; 3], velocity: [f32; 3]) {
        self.edit_3d_voice(handle, |sv| {
            sv.position = position;
            sv.velocity = velocity;
        });
    }

    pub fn set_3d_source_position(&self, handle: Handle, position: [f32; 3]) {
        self.edit_3d_voice(handle, |sv| sv.position = position);
    }

    pub fn set_3d_source_velocity(&self, handle: Handle, velocity: [f32; 3]) {
        self.edit_3d_voice(handle, |sv| sv.velocity = velocity);
    }

    pub fn set_3d_source_min_max_distance(&self, handle: Handle, min: f32, max: f32) {
        self.edit_3d_voice(handle, |sv| {
            sv.min_distance = min;
            sv.max_distance = max;
        });
    }

    pub fn set_3d_source_attenuation(
        &self,
        handle: Handle,
        model: crate::types::AttenuationModel,
        rolloff: f32,
    ) {
        self.edit_3d_voice(handle, |sv| {
            sv.attenuation = model;
            sv.rolloff_factor = rolloff;
        });
    }

    pub fn set_3d_source_doppler_factor(&self, handle: Handle, factor: f32) {
        self.edit_3d_voice(handle, |sv| sv.doppler_factor = factor);
    }

    fn edit_3d_voice(&self, handle: Handle, f: impl FnOnce(&mut SpatialVoice)) {
        let Some(slot) = handle.slot() else { return };
        let mut data3d = self.data3d.lock();
        if let Some(sv) = data3d.voices.get_mut(slot).and_then(Option::as_mut) {
            if sv.handle == handle {
                f(sv);
            }
        }
    }

    /// Recompute attenuation, doppler and speaker gains for all 3D voices
    /// and commit the results to the mixer. The math runs outside the
    /// audio mutex; call this once per game tick.
    pub fn update_3d_audio(&self) {
        let snapshot: Vec<(usize, Handle)> = {
            let inner = self.inner.lock();
            (0..inner.highest_voice)
                .filter_map(|slot| {
                    inner.voices[slot]
                        .as_ref()
                        .filter(|v| v.flags.process_3d)
                        .map(|v| (slot, Handle::from_slot(slot, v.play_index)))
                })
                .collect()
        };

        let mut results = Vec::with_capacity(snapshot.len());
        {
            let mut data3d = self.data3d.lock();
            for (slot, handle) in snapshot {
                let Some(mut sv) = data3d.voices[slot].take() else {
                    continue;
                };
                if sv.handle != handle {
                    // Slot was reused for a different voice
                    data3d.voices[slot] = Some(sv);
                    continue;
                }
                data3d.compute(&mut sv);
                results.push((handle, sv.out_volume, sv.out_doppler, sv.out_channel_volume));
                data3d.voices[slot] = Some(sv);
            }
        }

        let mut inner = self.inner.lock();
        for (handle, volume, doppler, channel_volume) in results {
            inner.commit_3d(handle, volume, doppler, channel_volume);
        }
    }
}
