use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::callbacks::{CallbackId, CallbackRegistry};

struct TimerEntry {
    callback: CallbackId,
    interval: Duration,
    last_fired: Duration,
}

/// Interval timers, each piggy-backed on a callback registration.
///
/// A timer is checked against the host's monotonic frame time once per tick.
/// Catch-up is phase-locked: after a stall the timer fires once and advances
/// `last_fired` by exactly one interval, so it stays on its original schedule
/// instead of resetting to "now".
#[derive(Default)]
pub struct TimerScheduler {
    timers: Mutex<Vec<TimerEntry>>,
    // Frame time of the most recent tick, in nanoseconds. Read when a timer is
    // scheduled so its first interval starts counting from the current frame.
    now_ns: AtomicU64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_now(&self, now: Duration) {
        self.now_ns.store(now.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::Relaxed))
    }

    /// Links a timer for `callback` at the head of the list with
    /// `last_fired = now`. Callers reach this through the deferred-call queue;
    /// timer registration happens inside script load paths that must not mutate
    /// the list in-line.
    pub(crate) fn schedule(&self, callback: CallbackId, interval: Duration) {
        let entry = TimerEntry { callback, interval, last_fired: self.now() };
        self.timers.lock().unwrap().push(entry);
    }

    /// One frame-tick pass: drops entries whose callback has been removed (the
    /// graveyard move already happened at removal time) and returns the due
    /// callbacks, newest registration first, with `last_fired` advanced by one
    /// interval each. Invocation is the caller's job, outside the list lock.
    pub(crate) fn sweep(&self, now: Duration, registry: &CallbackRegistry) -> Vec<CallbackId> {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|entry| !registry.is_removed(entry.callback));
        let mut due = Vec::new();
        for entry in timers.iter_mut().rev() {
            let elapsed = now.saturating_sub(entry.last_fired);
            if elapsed >= entry.interval {
                entry.last_fired += entry.interval;
                due.push(entry.callback);
            }
        }
        due
    }

    /// Last-fired timestamp of the timer attached to `callback`, if scheduled.
    pub fn last_fired(&self, callback: CallbackId) -> Option<Duration> {
        let timers = self.timers.lock().unwrap();
        timers.iter().find(|entry| entry.callback == callback).map(|entry| entry.last_fired)
    }

    pub fn len(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.timers.lock().unwrap().clear();
    }
}
