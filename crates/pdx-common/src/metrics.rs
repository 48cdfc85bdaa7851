//! Exchange statistics.
//!
//! Counters are written from the periodic task and from asynchronous
//! callers at the same time, so every field is a relaxed atomic. Nothing
//! here allocates or blocks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters shared between the cyclic task and its observers.
#[derive(Debug, Default)]
pub struct ExchangeStats {
    cycles: AtomicU64,
    receive_failures: AtomicU64,
    send_failures: AtomicU64,
    status_failures: AtomicU64,
    status_changes: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    overruns: AtomicU64,
    last_cycle_ns: AtomicU64,
    max_cycle_ns: AtomicU64,
}

/// Point-in-time copy of [`ExchangeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Completed cycles.
    pub cycles: u64,
    /// Receive phases that reported an error.
    pub receive_failures: u64,
    /// Send phases that reported an error.
    pub send_failures: u64,
    /// Status queries that reported an error.
    pub status_failures: u64,
    /// Status field changes reported.
    pub status_changes: u64,
    /// Asynchronous lock requests granted.
    pub granted: u64,
    /// Asynchronous lock requests denied inside the critical window.
    pub denied: u64,
    /// Cycles whose work took longer than the period.
    pub overruns: u64,
    /// Execution time of the most recent cycle.
    pub last_cycle_ns: u64,
    /// Longest cycle execution time seen.
    pub max_cycle_ns: u64,
}

impl ExchangeStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished cycle and its execution time.
    pub fn record_cycle(&self, execution: Duration, period: Duration) {
        let ns = u64::try_from(execution.as_nanos()).unwrap_or(u64::MAX);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_ns.store(ns, Ordering::Relaxed);
        self.max_cycle_ns.fetch_max(ns, Ordering::Relaxed);
        if execution > period {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failed receive phase.
    pub fn record_receive_failure(&self) {
        self.receive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed send phase.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed status query.
    pub fn record_status_failure(&self) {
        self.status_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` reported status field changes.
    pub fn record_status_changes(&self, count: u64) {
        self.status_changes.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a granted asynchronous lock request.
    pub fn record_granted(&self) {
        self.granted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denied asynchronous lock request.
    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed cycles so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            status_failures: self.status_failures.load(Ordering::Relaxed),
            status_changes: self.status_changes.load(Ordering::Relaxed),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            last_cycle_ns: self.last_cycle_ns.load(Ordering::Relaxed),
            max_cycle_ns: self.max_cycle_ns.load(Ordering::Relaxed),
        }
    }
}
