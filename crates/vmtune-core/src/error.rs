//! Error types for vmtune
//!
//! One domain error enum is threaded through lookup, guard, quota and
//! dispatch layers and translated exactly once at the API boundary.

use crate::types::{HostRef, InstanceId, Operation, ProjectId};

/// Domain failure raised below the API boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    /// Malformed or out-of-range request
    #[error("invalid request: {0}")]
    Validation(String),

    /// Policy denied the caller
    #[error("policy does not allow {alias} to be performed by {user}")]
    Unauthorized {
        /// Policy alias checked
        alias: String,
        /// Calling user
        user: String,
    },

    /// Unknown instance id
    #[error("instance {id} could not be found")]
    InstanceNotFound {
        /// Requested id
        id: InstanceId,
    },

    /// Instance exists but its host cannot be resolved
    #[error("instance {id} is in an unknown location")]
    UnknownLocation {
        /// Requested id
        id: InstanceId,
    },

    /// Lifecycle state forbids the operation
    #[error("instance {id} in {attr} {state}. Cannot {method} while the instance is in this state")]
    InvalidState {
        /// Instance id
        id: InstanceId,
        /// Attribute checked (`power_state` or `task_state`)
        attr: &'static str,
        /// Actual value of the attribute
        state: String,
        /// Operation refused
        method: Operation,
    },

    /// Agent actively rejected the requested value
    #[error("unable to {operation} instance {id}: {reason}")]
    SetFailed {
        /// Instance id
        id: InstanceId,
        /// Operation rejected
        operation: Operation,
        /// Agent-supplied reason
        reason: String,
    },

    /// Backend cannot perform this class of change at all
    #[error("{operation} is not supported for instance {id}")]
    NotSupported {
        /// Instance id
        id: InstanceId,
        /// Unsupported operation
        operation: Operation,
    },

    /// Another reconfiguration of the same instance is still in flight
    #[error("instance {id} is busy with another reconfiguration")]
    InstanceBusy {
        /// Instance id
        id: InstanceId,
    },

    /// Quota hold refused
    #[error("quota exceeded for {resource} in project {project}: requested {requested}, available {available}")]
    QuotaExceeded {
        /// Project charged
        project: ProjectId,
        /// Resource name
        resource: &'static str,
        /// Requested amount
        requested: i64,
        /// Remaining headroom
        available: i64,
    },

    /// Reservation misuse (unknown id, double release)
    #[error("reservation error: {0}")]
    Reservation(String),

    /// Command channel to the host agent failed
    #[error("agent on {host} unavailable: {reason}")]
    AgentUnavailable {
        /// Target host
        host: HostRef,
        /// Channel failure detail
        reason: String,
    },
}

impl ComputeError {
    /// Maps to a not-found outcome at the boundary
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. } | Self::UnknownLocation { .. })
    }

    /// Maps to a conflict outcome at the boundary
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::SetFailed { .. } | Self::InstanceBusy { .. }
        )
    }

    /// Whether a caller may reasonably retry later; this layer never does
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InstanceBusy { .. } | Self::AgentUnavailable { .. })
    }

    /// Create a power-state violation
    #[inline]
    pub fn invalid_power_state(
        id: InstanceId,
        state: impl std::fmt::Display,
        method: Operation,
    ) -> Self {
        Self::InvalidState {
            id,
            attr: "power_state",
            state: state.to_string(),
            method,
        }
    }
}
