//! Linear parameter interpolator with LFO and countdown-scheduler modes
//!
//! Faders drive every time-varying scalar in the engine: volume and pan
//! fades, relative play speed ramps, the global volume fade, filter
//! parameter automation, and (as plain countdowns) the pause/stop
//! schedulers.
//!
//! Time is the driving voice's stream time, which can restart from zero
//! when a voice is seeked. An active fader detects that rollover and
//! restarts from its current value over the proportional remaining time,
//! so an in-flight fade never jumps.

use std::f64::consts::PI;

/// Lifecycle of a fader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaderState {
    /// Not set up; `get()` returns the current value unchanged
    #[default]
    Disabled,
    /// Interpolating between `from` and `to`
    Active,
    /// Oscillating between `from` and `to` forever
    Lfo,
    /// Reached `to`; the owner may consume this as a completion event
    Inactive,
}

/// Scalar interpolator
#[derive(Debug, Clone, Copy, Default)]
pub struct Fader {
    pub from: f32,
    pub to: f32,
    delta: f32,
    /// Fade duration (seconds), or LFO period
    pub time: f64,
    start_time: f64,
    end_time: f64,
    /// Last value produced by `get()`
    pub current: f32,
    pub state: FaderState,
}

impl Fader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a linear fade from `from` to `to` over `time` seconds
    pub fn set(&mut self, from: f32, to: f32, time: f64, start_time: f64) {
        self.current = from;
        self.from = from;
        self.to = to;
        self.time = time;
        self.delta = to - from;
        self.start_time = start_time;
        self.end_time = start_time + time;
        self.state = FaderState::Active;
    }

    /// Begin oscillating between `from` and `to` with the given period.
    ///
    /// The wave starts at the midpoint and never self-deactivates.
    pub fn set_lfo(&mut self, from: f32, to: f32, period: f64, start_time: f64) {
        self.from = from;
        self.to = to;
        self.delta = (to - from) / 2.0;
        self.time = period.max(f64::EPSILON);
        self.start_time = start_time;
        // Angular frequency, so get() is a single sin()
        self.end_time = (PI * 2.0) / self.time;
        self.current = from + self.delta;
        self.state = FaderState::Lfo;
    }

    /// Whether `get()` currently produces changing values
    pub fn is_driving(&self) -> bool {
        matches!(self.state, FaderState::Active | FaderState::Lfo)
    }

    /// Stop driving without changing the current value
    pub fn disable(&mut self) {
        self.state = FaderState::Disabled;
    }

    /// Sample the fader at time `now` (seconds)
    pub fn get(&mut self, now: f64) -> f32 {
        match self.state {
            FaderState::Disabled | FaderState::Inactive => self.current,
            FaderState::Lfo => {
                if self.start_time > now {
                    // Clock rolled over (voice was seeked); re-anchor
                    self.start_time = now;
                }
                let t = now - self.start_time;
                self.current = self.from + self.delta + ((t * self.end_time).sin() as f32) * self.delta;
                self.current
            }
            FaderState::Active => {
                if self.start_time > now {
                    // Clock rolled over mid-fade: restart from the current
                    // value over the proportional remaining time
                    let progress = if self.delta != 0.0 {
                        ((self.current - self.from) / self.delta).clamp(0.0, 1.0) as f64
                    } else {
                        1.0
                    };
                    self.from = self.current;
                    self.delta = self.to - self.from;
                    self.start_time = now;
                    self.time *= 1.0 - progress;
                    self.end_time = self.start_time + self.time;
                }
                if now >= self.end_time || self.time <= 0.0 {
                    self.current = self.to;
                    self.state = FaderState::Inactive;
                    return self.current;
                }
                let t = ((now - self.start_time) / self.time) as f32;
                self.current = self.from + self.delta * t;
                self.current
            }
        }
    }
}
