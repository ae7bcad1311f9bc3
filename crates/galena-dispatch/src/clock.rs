//! Microsecond time sources.
//!
//! All scheduling decisions in the dispatch core read time through the
//! [`Clock`] trait so that tests can drive the queue with a hand-cranked
//! clock instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use galena_types::Timestamp;

/// A source of microsecond timestamps.
pub trait Clock: Send + Sync {
    /// The current time. Successive calls never go backwards.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time with monotonicity enforced.
///
/// Reads `SystemTime` and pins the result to a high-water mark, so a
/// stepped-back system clock can never make `now` regress:
/// `max(current_time, previous_timestamp)`.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64);
        let pinned = self
            .high_water
            .fetch_max(wall, Ordering::AcqRel)
            .max(wall);
        Timestamp::from_micros(pinned)
    }
}

/// A test clock advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros()),
        }
    }

    /// Moves the clock forward by `micros`.
    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Sets the clock to an absolute time. Must not move backwards.
    pub fn set(&self, to: Timestamp) {
        self.micros.fetch_max(to.as_micros(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::Acquire))
    }
}
