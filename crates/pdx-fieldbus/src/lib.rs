//! Bus master plane of the process-data exchange coordinator.
//!
//! This crate provides:
//! - [`BusProvider`] and [`BusMaster`] traits describing the bus-master driver
//! - [`LockCallbacks`], the capability a driver uses to serialize its own
//!   asynchronous work against the cyclic exchange
//! - [`binding`] module with the static process-variable mapping table
//! - [`image`] module with the task-owned process image
//! - [`simulated`] module with an in-memory master for tests and dry runs

pub mod binding;
pub mod image;
pub mod simulated;

pub use binding::*;
pub use image::*;
pub use simulated::*;

use pdx_common::PdxResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Outcome of an asynchronous lock request.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Exclusive access granted; the caller must call `leave()`.
    Granted,
    /// Too close to the next cycle deadline; retry after the next cycle starts.
    Denied,
    /// The exchange has been torn down; the bus is gone.
    Closed,
}

impl Admission {
    /// Returns true if the caller now holds the lock.
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Lock capability handed to the bus master at setup.
///
/// The driver calls `try_enter` before touching master state from any
/// context other than the cyclic task and `leave` when done. `leave` must
/// only follow a `Granted` admission.
pub trait LockCallbacks: Send + Sync {
    /// Request exclusive access. Never blocks when the answer is `Denied`.
    fn try_enter(&self) -> Admission;

    /// Give exclusive access back.
    fn leave(&self);
}

/// Handle of a process-data domain inside a bus master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain{}", self.0)
    }
}

/// Overall bus state reported by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    /// Link down or topology broken.
    Failure,
    /// Bus running normally.
    #[default]
    Ok,
    /// Running over the redundant link.
    Redundancy,
}

impl BusStatus {
    /// Numeric code used in status change reports.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Failure => -1,
            Self::Ok => 0,
            Self::Redundancy => 1,
        }
    }
}

/// Bus health sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Link status of the bus.
    pub bus_status: BusStatus,
    /// Set when the bus topology differs from the configuration.
    pub tainted: bool,
    /// Number of peripheral devices answering.
    pub slaves_responding: u32,
}

/// Entry point to the bus-master driver.
pub trait BusProvider {
    /// Master handle type handed out by this provider.
    type Master: BusMaster;

    /// Reserve the master with the given index.
    fn request_master(&mut self, index: u32) -> PdxResult<Self::Master>;
}

/// A reserved bus master.
///
/// Methods taking `&mut self` run during startup, before the handle is
/// shared. Methods taking `&self` run while the caller holds the shared
/// lock, so implementations may rely on being called serially.
pub trait BusMaster: Send + Sync + 'static {
    /// Install the lock capability used by the driver's own asynchronous work.
    fn register_lock_callbacks(&mut self, callbacks: Arc<dyn LockCallbacks>);

    /// Create a process-data domain.
    fn create_domain(&mut self) -> PdxResult<DomainId>;

    /// Register the mapping table with `domain`, returning the resolved slots.
    fn register_bindings(
        &mut self,
        domain: DomainId,
        table: &[PdoRegistration],
    ) -> PdxResult<Vec<ProcessVariableBinding>>;

    /// Activate the master; the domain layout is frozen afterwards.
    fn activate(&mut self) -> PdxResult<()>;

    /// Size of the domain memory in bytes.
    fn domain_size(&self, domain: DomainId) -> PdxResult<usize>;

    /// Fetch newly arrived frames.
    fn receive(&self) -> PdxResult<()>;

    /// Copy received domain memory into `image`.
    fn process_domain(&self, domain: DomainId, image: &mut [u8]) -> PdxResult<()>;

    /// Queue `image` as the domain's outgoing data.
    fn queue_domain(&self, domain: DomainId, image: &[u8]) -> PdxResult<()>;

    /// Transmit queued frames.
    fn send(&self) -> PdxResult<()>;

    /// Query bus health.
    fn status(&self) -> PdxResult<StatusSnapshot>;

    /// Release a domain created by [`create_domain`](Self::create_domain).
    fn release_domain(&self, domain: DomainId);

    /// Release the master reservation.
    fn release(&self);
}
