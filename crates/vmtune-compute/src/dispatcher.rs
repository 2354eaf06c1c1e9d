//! Reconfiguration dispatcher
//!
//! Turns a guarded request into an agent command and interprets the
//! acknowledgement. Acceptance says nothing about the final value: callers
//! observe it later through the completion handle or a fresh read.

use crate::agent::{AgentAck, AgentChannel, AgentCommand, Completion, CompletionHandle};
use crate::quota::Reservation;
use std::sync::Arc;
use vmtune_core::{ComputeError, Flavor, HostRef, ImageRef, Instance, InstanceId, Operation, ResourceKind};

/// Proof that an agent accepted a command
#[derive(Debug)]
pub struct DispatchReceipt {
    instance: InstanceId,
    operation: Operation,
    host: HostRef,
    completion: CompletionHandle,
}

impl DispatchReceipt {
    /// Instance the command targets
    #[inline]
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Operation accepted
    #[inline]
    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Host that accepted the command
    #[inline]
    #[must_use]
    pub fn host(&self) -> &HostRef {
        &self.host
    }

    /// Wait for the agent's completion report
    pub async fn completion(self) -> Completion {
        self.completion.wait().await
    }
}

/// Sends reconfiguration commands to hosting agents
#[derive(Clone)]
pub struct ReconfigurationDispatcher {
    channel: Arc<dyn AgentChannel>,
}

impl ReconfigurationDispatcher {
    /// Create dispatcher over a messaging channel
    #[inline]
    #[must_use]
    pub fn new(channel: Arc<dyn AgentChannel>) -> Self {
        Self { channel }
    }

    /// Hot-change one resource
    ///
    /// # Errors
    /// - `SetFailed` if the agent rejects the value
    /// - `NotSupported` if the backend cannot hot-change this resource
    /// - `UnknownLocation` / `AgentUnavailable` on routing failures
    pub async fn dispatch(
        &self,
        kind: ResourceKind,
        instance: &Instance,
        new_value: u64,
    ) -> Result<DispatchReceipt, ComputeError> {
        let command = match kind {
            ResourceKind::Vcpus => AgentCommand::SetVcpus {
                instance: instance.id.clone(),
                vcpus: u32::try_from(new_value).map_err(|_| {
                    ComputeError::Validation(format!("vcpus {new_value} out of range"))
                })?,
            },
            ResourceKind::Memory => AgentCommand::SetMem {
                instance: instance.id.clone(),
                memory_mb: new_value,
            },
        };
        self.send(instance, command).await
    }

    /// Change flavor of a running instance
    pub async fn live_resize(
        &self,
        instance: &Instance,
        flavor: &Flavor,
        image: Option<&ImageRef>,
        reservation: Option<&Reservation>,
    ) -> Result<DispatchReceipt, ComputeError> {
        let command = AgentCommand::LiveResize {
            instance: instance.id.clone(),
            flavor: flavor.clone(),
            image: image.cloned(),
            reservation: reservation.map(Reservation::id),
        };
        self.send(instance, command).await
    }

    /// Cold-resize an instance
    pub async fn resize(
        &self,
        instance: &Instance,
        flavor: &Flavor,
        reservation: Option<&Reservation>,
    ) -> Result<DispatchReceipt, ComputeError> {
        let command = AgentCommand::Resize {
            instance: instance.id.clone(),
            flavor: flavor.clone(),
            reservation: reservation.map(Reservation::id),
        };
        self.send(instance, command).await
    }

    /// Move an instance to `destination`
    pub async fn migrate(
        &self,
        instance: &Instance,
        destination: &HostRef,
    ) -> Result<DispatchReceipt, ComputeError> {
        let command = AgentCommand::Migrate {
            instance: instance.id.clone(),
            destination: destination.clone(),
        };
        self.send(instance, command).await
    }

    async fn send(
        &self,
        instance: &Instance,
        command: AgentCommand,
    ) -> Result<DispatchReceipt, ComputeError> {
        let host = instance
            .host
            .clone()
            .ok_or_else(|| ComputeError::UnknownLocation {
                id: instance.id.clone(),
            })?;
        let operation = command.operation();
        let name = command.name();

        match self.channel.cast(&host, command).await? {
            AgentAck::Accepted(completion) => {
                tracing::info!(instance = %instance.id, %host, command = name, "dispatch accepted");
                Ok(DispatchReceipt {
                    instance: instance.id.clone(),
                    operation,
                    host,
                    completion,
                })
            }
            AgentAck::Rejected { reason } => {
                tracing::warn!(instance = %instance.id, %host, command = name, %reason, "dispatch rejected");
                Err(ComputeError::SetFailed {
                    id: instance.id.clone(),
                    operation,
                    reason,
                })
            }
            AgentAck::Unsupported => {
                tracing::warn!(instance = %instance.id, %host, command = name, "dispatch unsupported");
                Err(ComputeError::NotSupported {
                    id: instance.id.clone(),
                    operation,
                })
            }
        }
    }
}

impl std::fmt::Debug for ReconfigurationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationDispatcher").finish_non_exhaustive()
    }
}
