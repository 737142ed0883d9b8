use std::time::{Duration, Instant};

/// One host frame: the monotonic frame timestamp the Timer Scheduler compares
/// intervals against, and the delta seconds handed to tick handlers. Tests
/// build these by hand to simulate stalls and missed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameTick {
    pub now: Duration,
    pub seconds: f32,
}

/// Real-time source of `FrameTick`s for production hosts.
pub struct FrameClock {
    start: Instant,
    last: Instant,
}

impl FrameClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now }
    }

    pub fn tick(&mut self) -> FrameTick {
        let now = Instant::now();
        let delta = now - self.last;
        self.last = now;
        FrameTick { now: now - self.start, seconds: delta.as_secs_f32() }
    }

    pub fn elapsed(&self) -> Duration {
        self.last - self.start
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
