//! Monotonic time sources used for scheduling.
//!
//! All scheduling decisions are made against a [`Clock`]. The [`MonotonicClock`] is backed by
//! [`tokio::time::Instant`], which means that it also follows a paused tokio runtime in tests.
//! The [`ManualClock`] is fully under the control of the caller.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A non-decreasing source of timestamps.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current time.
    ///
    /// Consecutive calls never return a value that is earlier than a previously returned one.
    fn now(&self) -> Instant;
}

/// The default [`Clock`], reading the monotonic runtime clock.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<Instant>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap();
        if now > *last {
            *last = now;
        }
        *last
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Creates a clock frozen at the current runtime time.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    /// Sets the clock to `to`, ignoring attempts to move it backwards.
    pub fn set(&self, to: Instant) {
        let mut now = self.now.lock().unwrap();
        if to > *now {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
