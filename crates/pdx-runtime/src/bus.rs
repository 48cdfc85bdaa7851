//! Shared bus handle and the asynchronous access path.
//!
//! The master is owned by a [`BusHandle`] shared between the periodic task
//! and any number of [`BusAccess`] clones. Every use of the master goes
//! through the shared lock; asynchronous users additionally pass the
//! deadline gate.

use crate::gate::DeadlineGate;
use crate::lock::SharedLock;
use pdx_fieldbus::{Admission, BindingTable, BusMaster, DomainId};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// Why an asynchronous caller did not get the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    /// The request fell into the inhibit time; retry after the next cycle starts.
    #[error("request too close to the next cycle deadline")]
    Denied,
    /// The exchange was torn down.
    #[error("bus exchange closed")]
    Closed,
}

/// Master, domain and gate of a running exchange.
pub struct BusHandle<M> {
    gate: Arc<DeadlineGate>,
    master: M,
    domain: DomainId,
    bindings: BindingTable,
}

impl<M> fmt::Debug for BusHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHandle")
            .field("gate", &self.gate)
            .field("domain", &self.domain)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl<M: BusMaster> BusHandle<M> {
    pub(crate) fn new(
        gate: Arc<DeadlineGate>,
        master: M,
        domain: DomainId,
        bindings: BindingTable,
    ) -> Self {
        Self {
            gate,
            master,
            domain,
            bindings,
        }
    }

    /// Gate in front of the shared lock.
    #[must_use]
    pub fn gate(&self) -> &Arc<DeadlineGate> {
        &self.gate
    }

    /// The shared lock.
    #[must_use]
    pub fn shared_lock(&self) -> &SharedLock {
        self.gate.shared_lock()
    }

    /// Process-data domain of the exchange.
    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Resolved process variable slots.
    #[must_use]
    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Unguarded master access. Callers must hold the shared lock.
    pub(crate) fn master(&self) -> &M {
        &self.master
    }
}

/// Exclusive access to the master for one asynchronous caller.
///
/// Leaves the gate when dropped.
#[must_use = "the bus is released as soon as the guard is dropped"]
pub struct AccessGuard<'a, M: BusMaster> {
    handle: &'a BusHandle<M>,
}

impl<M: BusMaster> Deref for AccessGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.handle.master()
    }
}

impl<M: BusMaster> Drop for AccessGuard<'_, M> {
    fn drop(&mut self) {
        self.handle.gate.leave();
    }
}

/// Cloneable handle for asynchronous (non-cyclic) bus access.
pub struct BusAccess<M> {
    handle: Arc<BusHandle<M>>,
}

impl<M> Clone for BusAccess<M> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<M> fmt::Debug for BusAccess<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusAccess")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<M: BusMaster> BusAccess<M> {
    pub(crate) fn new(handle: Arc<BusHandle<M>>) -> Self {
        Self { handle }
    }

    /// Ask the gate for the bus right now.
    ///
    /// # Errors
    ///
    /// [`Refusal::Denied`] inside the inhibit time, [`Refusal::Closed`]
    /// after teardown.
    pub fn enter(&self) -> Result<AccessGuard<'_, M>, Refusal> {
        match self.handle.gate.try_enter_at(self.handle.gate.clock().now()) {
            Admission::Granted => Ok(AccessGuard {
                handle: &self.handle,
            }),
            Admission::Denied => Err(Refusal::Denied),
            Admission::Closed => Err(Refusal::Closed),
        }
    }

    /// Run `f` against the master if the gate admits the request.
    ///
    /// # Errors
    ///
    /// See [`enter`](Self::enter).
    pub fn try_with<R>(&self, f: impl FnOnce(&M) -> R) -> Result<R, Refusal> {
        let guard = self.enter()?;
        Ok(f(&*guard))
    }

    /// Like [`try_with`](Self::try_with), but sleeps until the next cycle
    /// start after each denial, up to `attempts` tries in total.
    ///
    /// # Errors
    ///
    /// [`Refusal::Denied`] if every attempt was denied, [`Refusal::Closed`]
    /// as soon as the exchange is gone.
    pub fn with_retry<R>(&self, attempts: u32, f: impl FnOnce(&M) -> R) -> Result<R, Refusal> {
        for attempt in 1..=attempts {
            match self.enter() {
                Ok(guard) => return Ok(f(&*guard)),
                Err(Refusal::Closed) => return Err(Refusal::Closed),
                Err(Refusal::Denied) => {
                    let gate = &self.handle.gate;
                    let delay = gate.retry_delay(gate.clock().now());
                    debug!(attempt, ?delay, "Bus access denied, waiting for next cycle");
                    thread::sleep(delay);
                }
            }
        }
        Err(Refusal::Denied)
    }

    /// Resolved process variable slots.
    #[must_use]
    pub fn bindings(&self) -> &BindingTable {
        self.handle.bindings()
    }
}
