//! Periodic task lifecycle.
//!
//! State transitions:
//! IDLE → RUNNING → STOPPED
//!
//! IDLE → STOPPED is allowed so a task created but never armed can be
//! deleted during rollback. STOPPED is terminal.

use crate::error::{PdxError, PdxResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of the cyclic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, not yet armed with a period and first deadline.
    #[default]
    Idle,
    /// Executing the periodic loop.
    Running,
    /// Terminated by explicit teardown.
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl TaskState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::{Idle, Running, Stopped};

        matches!(
            (self, target),
            (Idle, Running) | (Running, Stopped) | (Idle, Stopped)
        )
    }

    /// Returns true once the task can no longer run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: TaskState,
    previous: Option<TaskState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<TaskState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: TaskState) -> PdxResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(PdxError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
