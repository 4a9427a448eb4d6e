//! Timing
//!
//! - [`Stopwatch`] measures the CPU time of a frame phase
//! - [`FrameClock`] supplies the timestamps used for standby timeouts, either
//!   from the wall clock or advanced manually for deterministic replays and tests

use std::time::{Duration, Instant};

/// Stopwatch measuring one frame phase at a time
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Stopwatch {
    /// Create a stopped stopwatch
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new measurement, discarding the previous one
    pub fn start(&mut self) {
        self.elapsed = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    /// Stop the current measurement and return it
    pub fn stop(&mut self) -> Duration {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        }
        self.elapsed
    }

    /// Measure a closure
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        self.start();
        let result = f();
        self.stop();
        result
    }

    /// Last completed (or running) measurement
    pub fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.elapsed + started.elapsed(),
            None => self.elapsed,
        }
    }

    /// Last measurement in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }
}

/// Source of frame timestamps, in seconds
#[derive(Debug, Clone)]
pub enum FrameClock {
    /// Seconds since the clock was created
    Wall { start: Instant },
    /// Time set by the caller
    Manual { now: f64 },
}

impl FrameClock {
    pub fn wall() -> Self {
        FrameClock::Wall { start: Instant::now() }
    }

    pub fn manual() -> Self {
        FrameClock::Manual { now: 0.0 }
    }

    /// Current timestamp
    pub fn now_seconds(&self) -> f64 {
        match self {
            FrameClock::Wall { start } => start.elapsed().as_secs_f64(),
            FrameClock::Manual { now } => *now,
        }
    }

    /// Advance a manual clock; no effect on a wall clock
    pub fn advance(&mut self, seconds: f64) {
        if let FrameClock::Manual { now } = self {
            *now += seconds.max(0.0);
        }
    }

    /// Set a manual clock; no effect on a wall clock
    pub fn set(&mut self, seconds: f64) {
        if let FrameClock::Manual { now } = self {
            *now = seconds;
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::wall()
    }
}
