use thiserror::Error;

/// Error types covering configuration, startup, per-cycle I/O and lock misuse.
///
/// A deadline denial of an asynchronous lock request is deliberately absent:
/// it is a normal control-flow outcome, not a failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PdxError {
    /// Configuration or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A startup step was rejected; the sequencer rolls back on this.
    #[error("setup step {step} failed: {reason}")]
    Setup {
        /// Name of the failed step.
        step: String,
        /// Failure reported by the collaborator.
        reason: String,
    },

    /// Bus master communication failure (send, receive, status query).
    #[error("fieldbus error: {0}")]
    Fieldbus(String),

    /// Real-time scheduler failure (timer, task creation, arming).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The shared lock was released by a context that does not hold it.
    #[error("shared lock released by a context not holding it")]
    LockNotHeld,

    /// Invalid task state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl PdxError {
    /// Wrap a collaborator failure as a setup error for `step`.
    pub fn setup(step: impl ToString, reason: impl ToString) -> Self {
        Self::Setup {
            step: step.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience type alias for exchange operations.
pub type PdxResult<T> = Result<T, PdxError>;
