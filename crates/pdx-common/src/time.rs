//! Monotonic cycle timebase.
//!
//! One tick is one nanosecond of a monotonic clock. Timestamps are only
//! compared against each other; they never carry wall-clock meaning.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Opaque monotonic tick value captured at the start of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct CycleTimestamp(u64);

impl CycleTimestamp {
    /// Build a timestamp from raw ticks.
    #[must_use]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Raw tick value.
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`, zero if `earlier` lies in the future.
    #[must_use]
    pub const fn ticks_since(self, earlier: CycleTimestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for CycleTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

/// Convert a duration into timebase ticks, saturating at `u64::MAX`.
#[must_use]
pub fn duration_to_ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Source of cycle timestamps.
pub trait Clock: Send + Sync {
    /// Current monotonic timestamp.
    fn now(&self) -> CycleTimestamp;
}

/// Clock backed by [`Instant`], counting from its own creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose tick zero is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> CycleTimestamp {
        CycleTimestamp(duration_to_ticks(self.origin.elapsed()))
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Create a clock at tick `start`.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute tick value. Moving backwards is ignored.
    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::AcqRel);
    }

    /// Advance by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Advance by a duration.
    pub fn advance_by(&self, duration: Duration) {
        self.advance(duration_to_ticks(duration));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> CycleTimestamp {
        CycleTimestamp(self.ticks.load(Ordering::Acquire))
    }
}
