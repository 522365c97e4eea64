//! Frame timing.
//!
//! A [`FrameScheduler`] plays the role of the host's animation-frame primitive: it
//! blocks until the next frame is due and returns its timestamp in milliseconds.
//! [`StopSignal`] lets another thread end the pump between ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Source of frame timestamps (milliseconds, monotonic).
pub trait FrameScheduler: Send {
    /// Current timestamp without waiting.
    fn now(&mut self) -> f64;

    /// Wait for the next frame and return its timestamp.
    fn next_frame(&mut self) -> f64;
}

/// Real-time scheduler that paces frames at a fixed rate.
///
/// A frame that runs late fires the next one immediately; deadlines then continue
/// from there instead of queueing catch-up frames.
#[derive(Debug)]
pub struct IntervalScheduler {
    origin: Instant,
    interval: Duration,
    next_deadline: Option<Instant>,
}

impl IntervalScheduler {
    pub fn new(target_fps: u32) -> Self {
        Self {
            origin: Instant::now(),
            interval: Duration::from_secs_f64(1.0 / target_fps.max(1) as f64),
            next_deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn millis_since_origin(&self, at: Instant) -> f64 {
        at.duration_since(self.origin).as_secs_f64() * 1000.0
    }
}

impl FrameScheduler for IntervalScheduler {
    fn now(&mut self) -> f64 {
        self.millis_since_origin(Instant::now())
    }

    fn next_frame(&mut self) -> f64 {
        let now = Instant::now();
        let deadline = match self.next_deadline {
            Some(d) => d.max(now),
            None => now + self.interval,
        };
        let wait = deadline.saturating_duration_since(now);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
        self.next_deadline = Some(deadline + self.interval);
        self.millis_since_origin(Instant::now())
    }
}

/// Virtual clock that advances by a fixed step per frame without sleeping.
///
/// Used for headless runs where output should not depend on wall-clock speed.
#[derive(Clone, Debug)]
pub struct SteppedScheduler {
    now: f64,
    step: f64,
}

impl SteppedScheduler {
    pub fn new(start_ms: f64, step_ms: f64) -> Self {
        Self {
            now: start_ms,
            step: step_ms,
        }
    }

    /// A stepped clock at the given frame rate starting at zero.
    pub fn at_fps(target_fps: u32) -> Self {
        Self::new(0.0, 1000.0 / target_fps.max(1) as f64)
    }
}

impl FrameScheduler for SteppedScheduler {
    fn now(&mut self) -> f64 {
        self.now
    }

    fn next_frame(&mut self) -> f64 {
        self.now += self.step;
        self.now
    }
}

/// Cross-thread stop flag checked by the pump once per tick.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Previous-frame timestamp used to compute per-tick deltas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameClock {
    previous: f64,
}

impl FrameClock {
    pub fn starting_at(now: f64) -> Self {
        Self { previous: now }
    }

    pub fn previous(&self) -> f64 {
        self.previous
    }

    /// Elapsed milliseconds since the previous frame.
    pub fn delta(&self, now: f64) -> f64 {
        now - self.previous
    }

    pub fn advance(&mut self, now: f64) {
        self.previous = now;
    }
}
