//! Deadline-aware admission of asynchronous lock requests.
//!
//! Each period is split in two: from the cycle start up to the critical
//! window, asynchronous callers may take the shared lock; in the trailing
//! inhibit time they are refused so the next receive/send phase is never
//! delayed by a slow external holder.
//!
//! ```text
//!  cycle start                      cycle start
//!  |<------ critical window ------>|<-inhibit->|
//!  |         grant (blocking)      |   deny    |
//! ```
//!
//! Before the first cycle has started there is no deadline to protect, so
//! every request is granted.

use crate::lock::{Holder, SharedLock};
use crossbeam_utils::CachePadded;
use pdx_common::config::ExchangeConfig;
use pdx_common::error::{PdxError, PdxResult};
use pdx_common::metrics::ExchangeStats;
use pdx_common::time::{duration_to_ticks, Clock, CycleTimestamp};
use pdx_fieldbus::{Admission, LockCallbacks};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// Marker for "no cycle has started yet".
const NO_CYCLE: u64 = u64::MAX;

/// Admission window inside one cycle period.
///
/// Invariant: `window < period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalWindow {
    window: Duration,
    period: Duration,
}

impl CriticalWindow {
    /// Build the window for `period` with `inhibit` reserved at its end.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::Config`] unless `0 < inhibit <= period`.
    pub fn new(period: Duration, inhibit: Duration) -> PdxResult<Self> {
        if period.is_zero() || inhibit.is_zero() || inhibit > period {
            return Err(PdxError::Config(format!(
                "inhibit time {inhibit:?} does not fit cycle period {period:?}"
            )));
        }
        Ok(Self {
            window: period - inhibit,
            period,
        })
    }

    /// Window derived from the configured frequency and inhibit time.
    ///
    /// # Errors
    ///
    /// See [`CriticalWindow::new`].
    pub fn from_config(config: &ExchangeConfig) -> PdxResult<Self> {
        Self::new(config.cycle_period(), config.inhibit_time)
    }

    /// Length of the admission window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cycle period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Reserved time at the end of each period.
    #[must_use]
    pub fn inhibit(&self) -> Duration {
        self.period - self.window
    }

    /// Same inhibit time applied to a different `period`.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::Config`] if the inhibit time no longer fits.
    pub fn with_period(&self, period: Duration) -> PdxResult<Self> {
        Self::new(period, self.inhibit())
    }
}

/// Policy object deciding whether an asynchronous caller may take the lock.
pub struct DeadlineGate {
    lock: Arc<SharedLock>,
    clock: Arc<dyn Clock>,
    last_cycle_start: CachePadded<AtomicU64>,
    window_ticks: AtomicU64,
    period_ticks: AtomicU64,
    closed: AtomicBool,
    stats: Arc<ExchangeStats>,
}

impl std::fmt::Debug for DeadlineGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineGate")
            .field("window", &self.critical_window())
            .field("last_cycle_start", &self.last_cycle_start())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl DeadlineGate {
    /// Create a gate in front of `lock`.
    pub fn new(
        lock: Arc<SharedLock>,
        clock: Arc<dyn Clock>,
        window: CriticalWindow,
        stats: Arc<ExchangeStats>,
    ) -> Self {
        Self {
            lock,
            clock,
            last_cycle_start: CachePadded::new(AtomicU64::new(NO_CYCLE)),
            window_ticks: AtomicU64::new(duration_to_ticks(window.window)),
            period_ticks: AtomicU64::new(duration_to_ticks(window.period)),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    /// The lock this gate guards.
    #[must_use]
    pub fn shared_lock(&self) -> &Arc<SharedLock> {
        &self.lock
    }

    /// The gate's time source.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Admission window currently in force.
    #[must_use]
    pub fn critical_window(&self) -> CriticalWindow {
        CriticalWindow {
            window: Duration::from_nanos(self.window_ticks.load(Ordering::Relaxed)),
            period: Duration::from_nanos(self.period_ticks.load(Ordering::Relaxed)),
        }
    }

    /// Switch to `window`, e.g. once the timer reports its actual period.
    ///
    /// Only meaningful before the periodic task is armed.
    pub fn retime(&self, window: CriticalWindow) {
        self.window_ticks
            .store(duration_to_ticks(window.window), Ordering::Relaxed);
        self.period_ticks
            .store(duration_to_ticks(window.period), Ordering::Relaxed);
    }

    /// Record the start of a cycle. Called by the periodic task only.
    pub fn mark_cycle_start(&self, now: CycleTimestamp) {
        self.last_cycle_start.store(now.ticks(), Ordering::Release);
    }

    /// Start of the most recent cycle, if any cycle ran.
    #[must_use]
    pub fn last_cycle_start(&self) -> Option<CycleTimestamp> {
        match self.last_cycle_start.load(Ordering::Acquire) {
            NO_CYCLE => None,
            ticks => Some(CycleTimestamp::from_ticks(ticks)),
        }
    }

    /// True if a request at `now` falls into the inhibit time.
    #[must_use]
    pub fn in_inhibit_time(&self, now: CycleTimestamp) -> bool {
        self.last_cycle_start()
            .is_some_and(|start| {
                now.ticks_since(start) > self.window_ticks.load(Ordering::Relaxed)
            })
    }

    /// Admission decision for a request made at `now`.
    ///
    /// Denials return immediately without touching the lock. Otherwise
    /// this blocks like a plain acquire.
    pub fn try_enter_at(&self, now: CycleTimestamp) -> Admission {
        if self.is_closed() {
            return Admission::Closed;
        }

        if self.in_inhibit_time(now) {
            self.stats.record_denied();
            trace!(now = now.ticks(), "Lock request inside inhibit time, denied");
            return Admission::Denied;
        }

        self.lock.acquire(Holder::External);
        if self.is_closed() {
            // closed while waiting: the bus is being torn down
            let _ = self.lock.release(Holder::External);
            return Admission::Closed;
        }

        self.stats.record_granted();
        Admission::Granted
    }

    /// Unconditional release after a granted request.
    pub fn leave(&self) {
        if let Err(e) = self.lock.release(Holder::External) {
            error!("Asynchronous caller left without holding the lock: {e}");
        }
    }

    /// How long a denied caller should wait before retrying at `now`.
    ///
    /// Points at the start of the next cycle so the retry lands inside a
    /// fresh admission window.
    #[must_use]
    pub fn retry_delay(&self, now: CycleTimestamp) -> Duration {
        let Some(start) = self.last_cycle_start() else {
            return Duration::ZERO;
        };
        let period_ticks = self.period_ticks.load(Ordering::Relaxed);
        if period_ticks == 0 {
            return Duration::ZERO;
        }
        let into_period = now.ticks_since(start) % period_ticks;
        Duration::from_nanos(period_ticks - into_period)
    }

    /// Refuse all further requests with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl LockCallbacks for DeadlineGate {
    fn try_enter(&self) -> Admission {
        self.try_enter_at(self.clock.now())
    }

    fn leave(&self) {
        DeadlineGate::leave(self);
    }
}
