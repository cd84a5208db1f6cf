//! Time sources for the sliding window.
//!
//! All timestamps are seconds since the Unix epoch as `f64`, which is the
//! unit reported back to callers in `LimitInfo`.

use std::time::Duration;

use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and the load simulator to drive windows and cooldowns
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: f64) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
