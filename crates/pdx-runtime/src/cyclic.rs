//! The periodic process-data exchange.
//!
//! One invocation of [`CyclicTask::run_cycle`] per period:
//! 1. Record the cycle start for the deadline gate
//! 2. Receive and process the domain (under the shared lock)
//! 3. Run the application logic on the process image
//! 4. Queue the domain and send (under the shared lock)
//! 5. Every N cycles, notify the logic and sample the bus status
//!
//! Failures of a single phase are counted and logged; the next period
//! runs regardless.

use crate::bus::BusHandle;
use crate::lock::Holder;
use crate::status::StatusTracker;
use pdx_common::error::{PdxError, PdxResult};
use pdx_common::metrics::ExchangeStats;
use pdx_fieldbus::{BindingTable, BusMaster, ProcessImage, ProcessVariableBinding};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Application logic run between receive and send.
pub trait CycleLogic: Send + 'static {
    /// Update outputs in `image` from its inputs.
    fn execute(&mut self, image: &mut ProcessImage);

    /// Called once per sub-period, before the status sample.
    fn sub_period_elapsed(&mut self) {}
}

/// Counts cycles down to the next sub-period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubPeriodCounter {
    reset: u32,
    remaining: u32,
}

impl SubPeriodCounter {
    /// Counter firing every `cycles` cycles (at least one).
    #[must_use]
    pub fn new(cycles: u32) -> Self {
        let reset = cycles.max(1);
        Self {
            reset,
            remaining: reset,
        }
    }

    /// Count one cycle. Returns true when the sub-period elapsed, in which
    /// case the counter has been reset.
    pub fn tick(&mut self) -> bool {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.remaining = self.reset;
            true
        } else {
            false
        }
    }

    /// Cycles left until the next boundary.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// Toggles one output between all-on and all-off each sub-period.
#[derive(Debug, Clone)]
pub struct BlinkLogic {
    output: ProcessVariableBinding,
    on: bool,
}

impl BlinkLogic {
    /// Pattern written while the output is on.
    pub const ON_PATTERN: u32 = 0x0F;

    /// Blink the variable `name` from `bindings`.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::Config`] if no such variable is bound.
    pub fn new(bindings: &BindingTable, name: &str) -> PdxResult<Self> {
        let output = bindings
            .get(name)
            .cloned()
            .ok_or_else(|| PdxError::Config(format!("blink output {name} is not bound")))?;
        Ok(Self { output, on: false })
    }

    /// Whether the output is currently on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl CycleLogic for BlinkLogic {
    fn execute(&mut self, image: &mut ProcessImage) {
        let value = if self.on { Self::ON_PATTERN } else { 0 };
        image.write(&self.output, value);
    }

    fn sub_period_elapsed(&mut self) {
        self.on = !self.on;
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// One-based number of this cycle.
    pub cycle: u64,
    /// Receive-phase failure, if any.
    pub receive_error: Option<PdxError>,
    /// Send-phase failure, if any.
    pub send_error: Option<PdxError>,
    /// Set on sub-period boundaries: number of status changes, or the
    /// status query failure.
    pub status: Option<PdxResult<usize>>,
}

impl CycleReport {
    /// True if no phase of the cycle failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.receive_error.is_none()
            && self.send_error.is_none()
            && !matches!(self.status, Some(Err(_)))
    }
}

/// State owned by the periodic task.
pub struct CyclicTask<M: BusMaster, L: CycleLogic> {
    bus: Arc<BusHandle<M>>,
    image: ProcessImage,
    logic: L,
    tracker: StatusTracker,
    counter: SubPeriodCounter,
    stats: Arc<ExchangeStats>,
    period: Duration,
    cycle_count: u64,
}

impl<M: BusMaster, L: CycleLogic> std::fmt::Debug for CyclicTask<M, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicTask")
            .field("image_len", &self.image.len())
            .field("counter", &self.counter)
            .field("period", &self.period)
            .field("cycle_count", &self.cycle_count)
            .finish_non_exhaustive()
    }
}

impl<M: BusMaster, L: CycleLogic> CyclicTask<M, L> {
    /// Create the task state. The process image is sized from the domain.
    ///
    /// # Errors
    ///
    /// Propagates a failed domain size query.
    pub fn new(
        bus: Arc<BusHandle<M>>,
        logic: L,
        tracker: StatusTracker,
        status_interval: u32,
        period: Duration,
        stats: Arc<ExchangeStats>,
    ) -> PdxResult<Self> {
        let size = {
            let _guard = bus.shared_lock().lock(Holder::Cycle);
            bus.master().domain_size(bus.domain())?
        };
        let size = size.max(bus.bindings().required_size());
        debug!(size, status_interval, "Process image allocated");

        Ok(Self {
            bus,
            image: ProcessImage::new(size),
            logic,
            tracker,
            counter: SubPeriodCounter::new(status_interval),
            stats,
            period,
            cycle_count: 0,
        })
    }

    /// Cycles completed so far.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// The task's process image.
    #[must_use]
    pub fn image(&self) -> &ProcessImage {
        &self.image
    }

    /// The application logic.
    #[must_use]
    pub fn logic(&self) -> &L {
        &self.logic
    }

    /// Run one period of the exchange.
    pub fn run_cycle(&mut self) -> CycleReport {
        let gate = self.bus.gate();
        let start = gate.clock().now();
        gate.mark_cycle_start(start);
        self.cycle_count += 1;
        let cycle = self.cycle_count;

        let lock = self.bus.shared_lock();
        let master = self.bus.master();
        let domain = self.bus.domain();

        let received = {
            let _guard = lock.lock(Holder::Cycle);
            master
                .receive()
                .and_then(|()| master.process_domain(domain, self.image.as_bytes_mut()))
        };
        if let Err(e) = &received {
            self.stats.record_receive_failure();
            warn!(cycle, "Receive phase failed: {e}");
        }

        self.logic.execute(&mut self.image);

        let sent = {
            let _guard = lock.lock(Holder::Cycle);
            master
                .queue_domain(domain, self.image.as_bytes())
                .and_then(|()| master.send())
        };
        if let Err(e) = &sent {
            self.stats.record_send_failure();
            warn!(cycle, "Send phase failed: {e}");
        }

        let status = if self.counter.tick() {
            self.logic.sub_period_elapsed();
            let result = self.tracker.sample(lock, master);
            match &result {
                Ok(changes) => self.stats.record_status_changes(*changes as u64),
                Err(e) => {
                    self.stats.record_status_failure();
                    warn!(cycle, "Status query failed: {e}");
                }
            }
            Some(result)
        } else {
            None
        };

        let execution = Duration::from_nanos(gate.clock().now().ticks_since(start));
        self.stats.record_cycle(execution, self.period);
        trace!(cycle, execution_ns = execution.as_nanos() as u64, "Cycle complete");

        CycleReport {
            cycle,
            receive_error: received.err(),
            send_error: sent.err(),
            status,
        }
    }
}
