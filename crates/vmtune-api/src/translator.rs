//! Boundary error translation
//!
//! The single place where domain failures become caller-visible outcomes.
//!
//! | failure | status | fault key |
//! |---|---|---|
//! | `InstanceNotFound`, `UnknownLocation` | 404 | `itemNotFound` |
//! | `InvalidState`, `SetFailed`, `InstanceBusy` | 409 | `conflictingRequest` |
//! | `QuotaExceeded`, `Unauthorized` | 403 | `forbidden` |
//! | `NotSupported` | 501 | `notImplemented` |
//! | `Validation` | 400 | `badRequest` |
//! | `AgentUnavailable`, `Reservation` | 500 | `computeFault` |

use crate::response::{ApiResponse, ApiStatus};
use vmtune_conductor::TaskError;
use vmtune_core::{ComputeError, Operation};

/// Maps domain failures to responses
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorTranslator;

impl ErrorTranslator {
    /// Create translator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Outcome class of a domain failure
    #[must_use]
    pub fn status(&self, error: &ComputeError) -> ApiStatus {
        match error {
            ComputeError::InstanceNotFound { .. } | ComputeError::UnknownLocation { .. } => {
                ApiStatus::NotFound
            }
            ComputeError::InvalidState { .. }
            | ComputeError::SetFailed { .. }
            | ComputeError::InstanceBusy { .. } => ApiStatus::Conflict,
            ComputeError::QuotaExceeded { .. } | ComputeError::Unauthorized { .. } => {
                ApiStatus::Forbidden
            }
            ComputeError::NotSupported { .. } => ApiStatus::NotImplemented,
            ComputeError::Validation(_) => ApiStatus::BadRequest,
            ComputeError::AgentUnavailable { .. } | ComputeError::Reservation(_) => {
                ApiStatus::InternalError
            }
        }
    }

    /// Translate a domain failure
    #[must_use]
    pub fn translate(&self, error: &ComputeError) -> ApiResponse {
        let status = self.status(error);
        let message = match error {
            ComputeError::InvalidState {
                id,
                attr,
                state,
                method,
            } => format!("Cannot '{method}' instance {id} while it is in {attr} {state}"),
            ComputeError::NotSupported { operation, .. } => unsupported_message(*operation),
            ComputeError::Unauthorized { alias, .. } => {
                format!("Policy doesn't allow {alias} to be performed.")
            }
            ComputeError::AgentUnavailable { .. } | ComputeError::Reservation(_) => {
                tracing::error!(error = %error, "unexpected failure at the boundary");
                format!("Unexpected API Error: {error}")
            }
            other => capitalize(&other.to_string()),
        };

        tracing::debug!(code = status.code(), %message, "translated failure");
        ApiResponse::fault(status, message)
    }

    /// Translate a task failure
    ///
    /// Domain failures map as above; phase misuse is a conflict and an
    /// unrecoverable rollback is an internal fault.
    #[must_use]
    pub fn translate_task(&self, error: &TaskError) -> ApiResponse {
        match error {
            TaskError::Compute(e) => self.translate(e),
            TaskError::AlreadyExecuted { .. } | TaskError::InvalidPhase { .. } => {
                ApiResponse::fault(ApiStatus::Conflict, capitalize(&error.to_string()))
            }
            TaskError::RollbackFailed { .. } => {
                tracing::error!(error = %error, "task left unreconciled");
                ApiResponse::fault(ApiStatus::InternalError, capitalize(&error.to_string()))
            }
        }
    }
}

fn unsupported_message(operation: Operation) -> String {
    match operation {
        Operation::SetVcpus => "Unable to set vcpus on instance".to_string(),
        Operation::SetMem => "Unable to set mem on instance".to_string(),
        other => format!("Unable to {other} instance"),
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vmtune_core::{InstanceId, PowerState, ProjectId, TaskId};

    fn translate(error: ComputeError) -> ApiResponse {
        ErrorTranslator::new().translate(&error)
    }

    #[test]
    fn invalid_state_message_names_attribute() {
        let response = translate(ComputeError::invalid_power_state(
            InstanceId::from("B"),
            PowerState::Shutdown,
            Operation::SetMem,
        ));
        assert_eq!(response.code(), 409);
        assert_eq!(
            response.message(),
            Some("Cannot 'setMem' instance B while it is in power_state shutdown")
        );
    }

    #[test]
    fn status_table() {
        let id = InstanceId::from("A");
        let cases = [
            (ComputeError::InstanceNotFound { id: id.clone() }, 404),
            (ComputeError::UnknownLocation { id: id.clone() }, 404),
            (
                ComputeError::SetFailed {
                    id: id.clone(),
                    operation: Operation::SetVcpus,
                    reason: "oversubscribed".into(),
                },
                409,
            ),
            (ComputeError::InstanceBusy { id: id.clone() }, 409),
            (
                ComputeError::QuotaExceeded {
                    project: ProjectId::from("p1"),
                    resource: "vcpus",
                    requested: 4,
                    available: 1,
                },
                403,
            ),
            (
                ComputeError::NotSupported {
                    id: id.clone(),
                    operation: Operation::SetMem,
                },
                501,
            ),
            (ComputeError::Validation("bad".into()), 400),
            (
                ComputeError::AgentUnavailable {
                    host: "node-9".into(),
                    reason: "gone".into(),
                },
                500,
            ),
        ];
        for (error, code) in cases {
            assert_eq!(translate(error).code(), code);
        }
    }

    #[test]
    fn not_supported_message() {
        let response = translate(ComputeError::NotSupported {
            id: InstanceId::from("A"),
            operation: Operation::SetVcpus,
        });
        assert_eq!(response.message(), Some("Unable to set vcpus on instance"));
        assert!(response.body.get("notImplemented").is_some());
    }

    #[test]
    fn not_found_message() {
        let response = translate(ComputeError::InstanceNotFound {
            id: InstanceId::from("Z"),
        });
        assert_eq!(response.message(), Some("Instance Z could not be found"));
    }

    #[test]
    fn task_errors() {
        let translator = ErrorTranslator::new();
        let task = TaskId::new();

        let twice = translator.translate_task(&TaskError::AlreadyExecuted { task });
        assert_eq!(twice.code(), 409);

        let unrecovered = translator.translate_task(&TaskError::RollbackFailed {
            task,
            reason: "agent gone".into(),
            original: None,
        });
        assert_eq!(unrecovered.code(), 500);
    }
}
