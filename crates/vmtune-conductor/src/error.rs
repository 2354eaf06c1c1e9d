//! Task errors

use crate::task::TaskPhase;
use vmtune_core::{ComputeError, TaskId};

/// Failure of a task execution or rollback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// `execute` called on a task that already left `pending`
    #[error("task {task} was already executed")]
    AlreadyExecuted {
        /// Task id
        task: TaskId,
    },

    /// Action not meaningful in the task's current phase
    #[error("cannot {action} task {task} in phase {phase}")]
    InvalidPhase {
        /// Task id
        task: TaskId,
        /// Current phase
        phase: TaskPhase,
        /// Refused action
        action: &'static str,
    },

    /// Domain failure while executing
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// Recovery did not restore the pre-change state
    #[error("rollback of task {task} failed: {reason}")]
    RollbackFailed {
        /// Task id
        task: TaskId,
        /// Every recovery step that failed
        reason: String,
        /// Execution failure that triggered the rollback, when known
        original: Option<Box<TaskError>>,
    },
}

impl TaskError {
    /// Underlying domain failure, if any
    #[must_use]
    pub fn as_compute(&self) -> Option<&ComputeError> {
        match self {
            Self::Compute(e) => Some(e),
            Self::RollbackFailed {
                original: Some(original),
                ..
            } => original.as_compute(),
            _ => None,
        }
    }

    /// Whether the instance may be left in a partially changed state
    #[inline]
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Attach the execution failure that led to a failed rollback
    #[must_use]
    pub fn with_original(self, error: TaskError) -> Self {
        match self {
            Self::RollbackFailed { task, reason, .. } => Self::RollbackFailed {
                task,
                reason,
                original: Some(Box::new(error)),
            },
            other => other,
        }
    }
}
