//! Edge-triggered bus status reporting.
//!
//! Every sample is compared field by field with the sample immediately
//! before it; only differing fields are reported. The stored sample starts
//! out zeroed, so the first sample reports every field that is not at its
//! zero value.

use crate::lock::{Holder, SharedLock};
use pdx_common::error::PdxResult;
use pdx_fieldbus::{BusMaster, StatusSnapshot};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Fields of a [`StatusSnapshot`] tracked for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    /// Link status.
    BusStatus,
    /// Topology/data integrity flag.
    Tainted,
    /// Count of responding devices.
    SlavesResponding,
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusStatus => write!(f, "bus_status"),
            Self::Tainted => write!(f, "tainted"),
            Self::SlavesResponding => write!(f, "slaves_responding"),
        }
    }
}

/// One changed field between two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    /// Field that changed.
    pub field: StatusField,
    /// Value in the previous sample.
    pub old: i64,
    /// Value in the new sample.
    pub new: i64,
}

impl fmt::Display for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.old, self.new)
    }
}

fn field_values(snapshot: &StatusSnapshot) -> [(StatusField, i64); 3] {
    [
        (StatusField::BusStatus, snapshot.bus_status.code()),
        (StatusField::Tainted, i64::from(snapshot.tainted)),
        (
            StatusField::SlavesResponding,
            i64::from(snapshot.slaves_responding),
        ),
    ]
}

/// Fields differing between `previous` and `current`, in declaration order.
pub fn diff(
    previous: &StatusSnapshot,
    current: &StatusSnapshot,
) -> impl Iterator<Item = StatusChange> {
    field_values(previous)
        .into_iter()
        .zip(field_values(current))
        .filter(|((_, old), (_, new))| old != new)
        .map(|((field, old), (_, new))| StatusChange { field, old, new })
}

/// Receiver of status change notifications.
pub type StatusSink = Box<dyn FnMut(&StatusChange) + Send>;

/// Holds the previous sample and reports changes.
pub struct StatusTracker {
    previous: StatusSnapshot,
    sink: Option<StatusSink>,
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("previous", &self.previous)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Tracker that only logs changes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            previous: StatusSnapshot::default(),
            sink: None,
        }
    }

    /// Tracker that also forwards each change to `sink`.
    #[must_use]
    pub fn with_sink(sink: StatusSink) -> Self {
        Self {
            previous: StatusSnapshot::default(),
            sink: Some(sink),
        }
    }

    /// The last successfully compared sample.
    #[must_use]
    pub fn previous(&self) -> StatusSnapshot {
        self.previous
    }

    /// Query the master under the lock and report changed fields.
    ///
    /// The lock is released before comparing. Returns the number of
    /// changes reported.
    ///
    /// # Errors
    ///
    /// Propagates a failed status query; the previous sample is kept.
    pub fn sample<M: BusMaster>(&mut self, lock: &SharedLock, master: &M) -> PdxResult<usize> {
        let current = {
            let _guard = lock.lock(Holder::Cycle);
            master.status()?
        };
        Ok(self.observe(current))
    }

    /// Compare `current` with the previous sample, report, then replace it.
    pub fn observe(&mut self, current: StatusSnapshot) -> usize {
        let mut count = 0;
        for change in diff(&self.previous, &current) {
            info!(
                field = %change.field,
                old = change.old,
                new = change.new,
                "Bus {} changed to {}",
                change.field,
                change.new
            );
            if let Some(sink) = self.sink.as_mut() {
                sink(&change);
            }
            count += 1;
        }
        self.previous = current;
        count
    }
}
