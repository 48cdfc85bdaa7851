//! Simulated bus master for testing without hardware.
//!
//! Frames loop back: data queued and sent in one cycle is what the next
//! receive delivers. Every call is recorded in a journal, failures can be
//! injected per operation, and overlapping calls (which the shared lock
//! must prevent) are counted as exclusion violations.

use crate::binding::{PdoRegistration, ProcessVariableBinding};
use crate::{Admission, BusMaster, BusProvider, DomainId, LockCallbacks, StatusSnapshot};
use pdx_common::error::{PdxError, PdxResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Operations a simulated master can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    /// `request_master`
    RequestMaster,
    /// `create_domain`
    CreateDomain,
    /// `register_bindings`
    RegisterBindings,
    /// `activate`
    Activate,
    /// `receive`
    Receive,
    /// `send`
    Send,
    /// `status`
    Status,
}

/// Journal entry for one bus master call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// Master reserved.
    RequestMaster(u32),
    /// Lock callbacks installed.
    RegisterCallbacks,
    /// Domain created.
    CreateDomain(DomainId),
    /// Table registered with a domain.
    RegisterBindings(DomainId, usize),
    /// Master activated.
    Activate,
    /// Frames received.
    Receive,
    /// Domain copied out.
    ProcessDomain(DomainId),
    /// Domain queued.
    QueueDomain(DomainId),
    /// Frames sent.
    Send,
    /// Status queried.
    Status,
    /// Driver-internal asynchronous work ran under the lock.
    DriverRequest,
    /// Domain released.
    ReleaseDomain(DomainId),
    /// Master released.
    Release,
}

#[derive(Debug, Default)]
struct Frames {
    /// Domain memory as last received.
    received: Vec<u8>,
    /// Data queued for the next send.
    queued: Vec<u8>,
    /// Data on the wire, delivered by the next receive.
    wire: Vec<u8>,
}

/// State shared by the provider, the master and test code.
#[derive(Default)]
pub struct SimulatedBus {
    journal: Mutex<Vec<BusOp>>,
    failures: Mutex<HashSet<FailurePoint>>,
    status: Mutex<StatusSnapshot>,
    frames: Mutex<Frames>,
    callbacks: Mutex<Option<Arc<dyn LockCallbacks>>>,
    active_ops: AtomicUsize,
    violations: AtomicU64,
}

impl std::fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBus")
            .field("journal_len", &lock(&self.journal).len())
            .field("violations", &self.violations.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedBus {
    /// Make `point` fail from now on.
    pub fn fail_at(&self, point: FailurePoint) {
        lock(&self.failures).insert(point);
    }

    /// Stop failing at `point`.
    pub fn clear_failure(&self, point: FailurePoint) {
        lock(&self.failures).remove(&point);
    }

    /// Set the status the next query will report.
    pub fn set_status(&self, status: StatusSnapshot) {
        *lock(&self.status) = status;
    }

    /// Copy of the journal.
    #[must_use]
    pub fn journal(&self) -> Vec<BusOp> {
        lock(&self.journal).clone()
    }

    /// Discard journal entries recorded so far.
    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    /// Number of times two lock-protected calls overlapped.
    #[must_use]
    pub fn exclusion_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Bytes currently on the wire, i.e. the last data sent.
    #[must_use]
    pub fn wire(&self) -> Vec<u8> {
        lock(&self.frames).wire.clone()
    }

    /// Run one piece of driver-internal asynchronous work.
    ///
    /// Goes through the registered lock callbacks exactly like a real
    /// driver's background context would. Returns `Closed` if no callbacks
    /// are registered.
    pub fn driver_request(&self) -> Admission {
        self.driver_work(Duration::ZERO)
    }

    /// Driver work that keeps the bus busy for `busy` once admitted.
    pub fn driver_work(&self, busy: Duration) -> Admission {
        let Some(callbacks) = lock(&self.callbacks).clone() else {
            return Admission::Closed;
        };

        let admission = callbacks.try_enter();
        if admission.is_granted() {
            let op = self.begin_op();
            self.record(BusOp::DriverRequest);
            if !busy.is_zero() {
                thread::sleep(busy);
            }
            drop(op);
            callbacks.leave();
        }
        admission
    }

    fn record(&self, op: BusOp) {
        lock(&self.journal).push(op);
    }

    fn check(&self, point: FailurePoint) -> PdxResult<()> {
        if lock(&self.failures).contains(&point) {
            Err(PdxError::Fieldbus(format!("simulated failure at {point:?}")))
        } else {
            Ok(())
        }
    }

    fn begin_op(&self) -> OpGuard<'_> {
        if self.active_ops.fetch_add(1, Ordering::AcqRel) != 0 {
            self.violations.fetch_add(1, Ordering::Relaxed);
        }
        OpGuard { bus: self }
    }
}

struct OpGuard<'a> {
    bus: &'a SimulatedBus,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.bus.active_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Provider handing out [`SimulatedMaster`]s that share one [`SimulatedBus`].
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    bus: Arc<SimulatedBus>,
}

impl SimulatedProvider {
    /// Create a provider with a fresh bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared bus state for inspection and failure injection.
    #[must_use]
    pub fn bus(&self) -> Arc<SimulatedBus> {
        Arc::clone(&self.bus)
    }
}

impl BusProvider for SimulatedProvider {
    type Master = SimulatedMaster;

    fn request_master(&mut self, index: u32) -> PdxResult<SimulatedMaster> {
        self.bus.check(FailurePoint::RequestMaster)?;
        self.bus.record(BusOp::RequestMaster(index));
        info!(index, "Simulated master reserved");
        Ok(SimulatedMaster {
            bus: Arc::clone(&self.bus),
            domains: Vec::new(),
            activated: false,
        })
    }
}

/// In-memory bus master.
#[derive(Debug)]
pub struct SimulatedMaster {
    bus: Arc<SimulatedBus>,
    /// Domain sizes in bytes, indexed by domain id.
    domains: Vec<usize>,
    activated: bool,
}

impl SimulatedMaster {
    fn domain_index(&self, domain: DomainId) -> PdxResult<usize> {
        let index = domain.0 as usize;
        if index < self.domains.len() {
            Ok(index)
        } else {
            Err(PdxError::Fieldbus(format!("unknown {domain}")))
        }
    }
}

impl BusMaster for SimulatedMaster {
    fn register_lock_callbacks(&mut self, callbacks: Arc<dyn LockCallbacks>) {
        *lock(&self.bus.callbacks) = Some(callbacks);
        self.bus.record(BusOp::RegisterCallbacks);
    }

    fn create_domain(&mut self) -> PdxResult<DomainId> {
        self.bus.check(FailurePoint::CreateDomain)?;
        let id = DomainId(u32::try_from(self.domains.len()).unwrap_or(u32::MAX));
        self.domains.push(0);
        self.bus.record(BusOp::CreateDomain(id));
        Ok(id)
    }

    fn register_bindings(
        &mut self,
        domain: DomainId,
        table: &[PdoRegistration],
    ) -> PdxResult<Vec<ProcessVariableBinding>> {
        self.bus.check(FailurePoint::RegisterBindings)?;
        if self.activated {
            return Err(PdxError::Fieldbus("master already active".into()));
        }
        let index = self.domain_index(domain)?;

        let mut offset = self.domains[index];
        let mut bindings = Vec::with_capacity(table.len());
        for reg in table {
            trace!(name = %reg.name, slave = %reg.slave, offset, "Mapping entry");
            let binding = ProcessVariableBinding {
                name: reg.name.clone(),
                offset,
                bit_position: 0,
                bit_len: reg.bit_len,
            };
            offset += binding.byte_len();
            bindings.push(binding);
        }
        self.domains[index] = offset;

        self.bus.record(BusOp::RegisterBindings(domain, table.len()));
        Ok(bindings)
    }

    fn activate(&mut self) -> PdxResult<()> {
        self.bus.check(FailurePoint::Activate)?;
        let size = self.domains.iter().sum();
        let mut frames = lock(&self.bus.frames);
        frames.received = vec![0; size];
        frames.queued = vec![0; size];
        frames.wire = vec![0; size];
        drop(frames);

        self.activated = true;
        self.bus.record(BusOp::Activate);
        debug!(size, "Simulated master active");
        Ok(())
    }

    fn domain_size(&self, domain: DomainId) -> PdxResult<usize> {
        Ok(self.domains[self.domain_index(domain)?])
    }

    fn receive(&self) -> PdxResult<()> {
        let _op = self.bus.begin_op();
        self.bus.check(FailurePoint::Receive)?;
        let mut frames = lock(&self.bus.frames);
        let wire = frames.wire.clone();
        frames.received.copy_from_slice(&wire);
        drop(frames);
        self.bus.record(BusOp::Receive);
        Ok(())
    }

    fn process_domain(&self, domain: DomainId, image: &mut [u8]) -> PdxResult<()> {
        let _op = self.bus.begin_op();
        let (start, end) = self.domain_range(domain)?;
        let frames = lock(&self.bus.frames);
        let len = image.len().min(end - start);
        image[..len].copy_from_slice(&frames.received[start..start + len]);
        drop(frames);
        self.bus.record(BusOp::ProcessDomain(domain));
        Ok(())
    }

    fn queue_domain(&self, domain: DomainId, image: &[u8]) -> PdxResult<()> {
        let _op = self.bus.begin_op();
        let (start, end) = self.domain_range(domain)?;
        let mut frames = lock(&self.bus.frames);
        let len = image.len().min(end - start);
        frames.queued[start..start + len].copy_from_slice(&image[..len]);
        drop(frames);
        self.bus.record(BusOp::QueueDomain(domain));
        Ok(())
    }

    fn send(&self) -> PdxResult<()> {
        let _op = self.bus.begin_op();
        self.bus.check(FailurePoint::Send)?;
        let mut frames = lock(&self.bus.frames);
        let queued = frames.queued.clone();
        frames.wire.copy_from_slice(&queued);
        drop(frames);
        self.bus.record(BusOp::Send);
        Ok(())
    }

    fn status(&self) -> PdxResult<StatusSnapshot> {
        let _op = self.bus.begin_op();
        self.bus.check(FailurePoint::Status)?;
        self.bus.record(BusOp::Status);
        Ok(*lock(&self.bus.status))
    }

    fn release_domain(&self, domain: DomainId) {
        let _op = self.bus.begin_op();
        self.bus.record(BusOp::ReleaseDomain(domain));
    }

    fn release(&self) {
        let _op = self.bus.begin_op();
        *lock(&self.bus.callbacks) = None;
        self.bus.record(BusOp::Release);
        info!("Simulated master released");
    }
}

impl SimulatedMaster {
    /// Byte range of `domain` inside the frame buffers.
    fn domain_range(&self, domain: DomainId) -> PdxResult<(usize, usize)> {
        let index = self.domain_index(domain)?;
        if !self.activated {
            return Err(PdxError::Fieldbus("master not active".into()));
        }
        let start: usize = self.domains[..index].iter().sum();
        Ok((start, start + self.domains[index]))
    }
}
