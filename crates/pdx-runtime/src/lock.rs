//! Binary lock guarding the bus master handle.
//!
//! Unlike a `Mutex`, acquisition and release are separate calls so that a
//! driver can hold the lock across its own `try_enter`/`leave` callbacks.
//! The cyclic task uses the same primitive through [`LockGuard`]; there is
//! no separate fast path.

use pdx_common::error::{PdxError, PdxResult};
use serde::Serialize;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Who, if anyone, holds the shared lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Nobody holds the lock.
    #[default]
    Free,
    /// Held by the periodic task.
    HeldByCycle,
    /// Held by an asynchronous caller.
    HeldByExternal,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::HeldByCycle => write!(f, "held-by-cycle"),
            Self::HeldByExternal => write!(f, "held-by-external"),
        }
    }
}

/// Execution context requesting the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// The periodic task.
    Cycle,
    /// Any asynchronous caller.
    External,
}

impl Holder {
    fn state(self) -> LockState {
        match self {
            Self::Cycle => LockState::HeldByCycle,
            Self::External => LockState::HeldByExternal,
        }
    }
}

/// Binary mutual-exclusion primitive with explicit acquire and release.
#[derive(Debug, Default)]
pub struct SharedLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl SharedLock {
    /// Create a free lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // The inner mutex only protects the state word; a panic while it was
    // held cannot leave it half-written.
    fn state_word(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the lock is free, then take it for `holder`.
    pub fn acquire(&self, holder: Holder) {
        let mut state = self.state_word();
        while *state != LockState::Free {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state = holder.state();
    }

    /// Take the lock for `holder` only if it is free right now.
    pub fn try_acquire(&self, holder: Holder) -> bool {
        let mut state = self.state_word();
        if *state == LockState::Free {
            *state = holder.state();
            true
        } else {
            false
        }
    }

    /// Return the lock held by `holder` to the free state and wake at most
    /// one waiter.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::LockNotHeld`] if `holder` does not hold the lock;
    /// the state is left unchanged.
    pub fn release(&self, holder: Holder) -> PdxResult<()> {
        let mut state = self.state_word();
        if *state != holder.state() {
            let current = *state;
            error!(?holder, state = %current, "Release by a context not holding the shared lock");
            return Err(PdxError::LockNotHeld);
        }
        *state = LockState::Free;
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    /// Acquire for `holder` and release when the guard drops.
    pub fn lock(&self, holder: Holder) -> LockGuard<'_> {
        self.acquire(holder);
        LockGuard { lock: self, holder }
    }

    /// Current holder.
    #[must_use]
    pub fn state(&self) -> LockState {
        *self.state_word()
    }
}

/// Scoped hold of a [`SharedLock`].
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a SharedLock,
    holder: Holder,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.holder) {
            error!(holder = ?self.holder, "Shared lock lost while guarded: {e}");
        }
    }
}
