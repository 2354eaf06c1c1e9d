//! Remote agent messaging
//!
//! Commands travel to compute hosts by message passing only. A cast returns
//! once the host agent acknowledges; the completion report arrives later on
//! a separate channel.
//!
//! [`AgentBus`] runs one in-process agent task per host, standing in for the
//! message bus and the hypervisor driver.

use crate::repository::{InstanceRepository, InstanceUpdate};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use vmtune_core::{
    ComputeError, Flavor, HostRef, ImageRef, InstanceId, Operation, ReservationId, ResourceKind,
};

/// Command sent to a host agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Hotplug vCPUs
    SetVcpus {
        /// Target instance
        instance: InstanceId,
        /// New vCPU count
        vcpus: u32,
    },
    /// Hottune memory
    SetMem {
        /// Target instance
        instance: InstanceId,
        /// New memory in MiB
        memory_mb: u64,
    },
    /// Change flavor while running
    LiveResize {
        /// Target instance
        instance: InstanceId,
        /// Target flavor
        flavor: Flavor,
        /// Source image
        image: Option<ImageRef>,
        /// Quota hold backing the change, for correlation
        reservation: Option<ReservationId>,
    },
    /// Cold resize
    Resize {
        /// Target instance
        instance: InstanceId,
        /// Target flavor
        flavor: Flavor,
        /// Quota hold backing the change, for correlation
        reservation: Option<ReservationId>,
    },
    /// Move to another host
    Migrate {
        /// Target instance
        instance: InstanceId,
        /// Destination host
        destination: HostRef,
    },
}

impl AgentCommand {
    /// Wire name of the command
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::SetVcpus { .. } => "setVcpus",
            AgentCommand::SetMem { .. } => "setMem",
            AgentCommand::LiveResize { .. } => "liveResizeInstance",
            AgentCommand::Resize { .. } => "resizeInstance",
            AgentCommand::Migrate { .. } => "migrateInstance",
        }
    }

    /// Targeted instance
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        match self {
            AgentCommand::SetVcpus { instance, .. }
            | AgentCommand::SetMem { instance, .. }
            | AgentCommand::LiveResize { instance, .. }
            | AgentCommand::Resize { instance, .. }
            | AgentCommand::Migrate { instance, .. } => instance,
        }
    }

    /// Operation this command performs
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            AgentCommand::SetVcpus { .. } => Operation::SetVcpus,
            AgentCommand::SetMem { .. } => Operation::SetMem,
            AgentCommand::LiveResize { .. } => Operation::LiveResize,
            AgentCommand::Resize { .. } => Operation::Resize,
            AgentCommand::Migrate { .. } => Operation::Migrate,
        }
    }

    fn into_update(self) -> InstanceUpdate {
        match self {
            AgentCommand::SetVcpus { vcpus, .. } => InstanceUpdate::Resource {
                kind: ResourceKind::Vcpus,
                value: u64::from(vcpus),
            },
            AgentCommand::SetMem { memory_mb, .. } => InstanceUpdate::Resource {
                kind: ResourceKind::Memory,
                value: memory_mb,
            },
            AgentCommand::LiveResize { flavor, .. } | AgentCommand::Resize { flavor, .. } => {
                InstanceUpdate::Flavor(flavor)
            }
            AgentCommand::Migrate { destination, .. } => InstanceUpdate::Host(destination),
        }
    }
}

/// Final report for an accepted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Change applied and persisted
    Applied,
    /// Agent gave up after accepting
    Failed {
        /// Agent-supplied reason
        reason: String,
    },
}

impl Completion {
    /// Whether the change was applied
    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Completion::Applied)
    }
}

/// Receiving end of a completion report
#[derive(Debug)]
pub struct CompletionHandle(oneshot::Receiver<Completion>);

impl CompletionHandle {
    /// Create a handle and the sender the agent reports on
    #[must_use]
    pub fn channel() -> (oneshot::Sender<Completion>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// Handle that is already resolved
    #[must_use]
    pub fn ready(completion: Completion) -> Self {
        let (tx, handle) = Self::channel();
        let _ = tx.send(completion);
        handle
    }

    /// Wait for the report; a vanished agent counts as failure
    pub async fn wait(self) -> Completion {
        self.0.await.unwrap_or_else(|_| Completion::Failed {
            reason: "agent dropped the completion channel".to_string(),
        })
    }
}

/// Agent acknowledgement of a cast
#[derive(Debug)]
pub enum AgentAck {
    /// Command accepted; completion follows
    Accepted(CompletionHandle),
    /// Requested value refused (e.g. oversubscription)
    Rejected {
        /// Agent-supplied reason
        reason: String,
    },
    /// Backend cannot perform this class of change
    Unsupported,
}

/// Messaging channel to host agents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Send `command` to the agent on `host` and wait for its acknowledgement
    ///
    /// # Errors
    /// `AgentUnavailable` when the host cannot be reached
    async fn cast(&self, host: &HostRef, command: AgentCommand) -> Result<AgentAck, ComputeError>;
}

/// Capabilities and limits of a simulated host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostProfile {
    /// Largest vCPU count one guest may have
    pub max_vcpus: u32,
    /// Largest memory one guest may have, MiB
    pub max_memory_mb: u64,
    /// Supports vCPU hotplug
    pub vcpu_hotplug: bool,
    /// Supports memory hottune
    pub mem_hottune: bool,
    /// Supports live resize
    pub live_resize: bool,
    /// Accept commands but fail while applying them
    pub fail_apply: bool,
    /// Delay between accepting and applying
    pub apply_delay_ms: u64,
}

impl HostProfile {
    /// With apply delay
    #[inline]
    #[must_use]
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Host that accepts every command then fails to apply it
    #[inline]
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    fn evaluate(&self, host: &HostRef, command: &AgentCommand) -> Result<(), AgentAckKind> {
        match command {
            AgentCommand::SetVcpus { vcpus, .. } => {
                if !self.vcpu_hotplug {
                    return Err(AgentAckKind::Unsupported);
                }
                self.fits(*vcpus, None)
            }
            AgentCommand::SetMem { memory_mb, .. } => {
                if !self.mem_hottune {
                    return Err(AgentAckKind::Unsupported);
                }
                self.fits(0, Some(*memory_mb))
            }
            AgentCommand::LiveResize { flavor, .. } => {
                if !self.live_resize {
                    return Err(AgentAckKind::Unsupported);
                }
                self.fits(flavor.vcpus, Some(flavor.memory_mb))
            }
            AgentCommand::Resize { flavor, .. } => self.fits(flavor.vcpus, Some(flavor.memory_mb)),
            AgentCommand::Migrate { destination, .. } => {
                if destination == host {
                    return Err(AgentAckKind::Rejected(format!(
                        "instance already runs on {host}"
                    )));
                }
                Ok(())
            }
        }
    }

    fn fits(&self, vcpus: u32, memory_mb: Option<u64>) -> Result<(), AgentAckKind> {
        if vcpus > self.max_vcpus {
            return Err(AgentAckKind::Rejected(format!(
                "requested {vcpus} vcpus exceeds host limit of {}",
                self.max_vcpus
            )));
        }
        if let Some(memory_mb) = memory_mb.filter(|m| *m > self.max_memory_mb) {
            return Err(AgentAckKind::Rejected(format!(
                "requested {memory_mb} MiB exceeds host limit of {} MiB",
                self.max_memory_mb
            )));
        }
        Ok(())
    }
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            max_vcpus: 32,
            max_memory_mb: 128 * 1024,
            vcpu_hotplug: true,
            mem_hottune: true,
            live_resize: true,
            fail_apply: false,
            apply_delay_ms: 0,
        }
    }
}

enum AgentAckKind {
    Rejected(String),
    Unsupported,
}

/// Envelope on a host agent's queue
#[derive(Debug)]
struct Envelope {
    command: AgentCommand,
    ack: oneshot::Sender<AgentAck>,
}

/// In-process message bus with one agent task per host
pub struct AgentBus {
    repository: Arc<dyn InstanceRepository>,
    queue_depth: usize,
    hosts: DashMap<HostRef, mpsc::Sender<Envelope>>,
}

impl AgentBus {
    /// Create bus whose agents persist applied changes into `repository`
    #[must_use]
    pub fn new(repository: Arc<dyn InstanceRepository>, queue_depth: usize) -> Self {
        Self {
            repository,
            queue_depth: queue_depth.max(1),
            hosts: DashMap::new(),
        }
    }

    /// Start an agent for `host`; replaces any previous agent
    pub fn register_host(&self, host: impl Into<HostRef>, profile: HostProfile) {
        let host = host.into();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        tokio::spawn(host_agent_task(
            host.clone(),
            profile,
            Arc::clone(&self.repository),
            rx,
        ));
        tracing::info!(%host, ?profile, "host agent registered");
        self.hosts.insert(host, tx);
    }

    /// Stop the agent for `host`; later casts fail as unavailable
    pub fn deregister_host(&self, host: &HostRef) {
        self.hosts.remove(host);
    }

    /// Registered hosts
    #[must_use]
    pub fn hosts(&self) -> Vec<HostRef> {
        let mut hosts: Vec<HostRef> = self.hosts.iter().map(|e| e.key().clone()).collect();
        hosts.sort();
        hosts
    }
}

impl std::fmt::Debug for AgentBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBus")
            .field("queue_depth", &self.queue_depth)
            .field("hosts", &self.hosts())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentChannel for AgentBus {
    async fn cast(&self, host: &HostRef, command: AgentCommand) -> Result<AgentAck, ComputeError> {
        let unavailable = |reason: &str| ComputeError::AgentUnavailable {
            host: host.clone(),
            reason: reason.to_string(),
        };

        let sender = self
            .hosts
            .get(host)
            .map(|e| e.value().clone())
            .ok_or_else(|| unavailable("no agent registered"))?;

        let name = command.name();
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(Envelope { command, ack: ack_tx })
            .await
            .map_err(|_| unavailable("agent queue closed"))?;

        tracing::debug!(%host, command = name, "command cast");
        ack_rx.await.map_err(|_| unavailable("agent dropped acknowledgement"))
    }
}

/// Agent lifecycle loop (runs in its own tokio task)
async fn host_agent_task(
    host: HostRef,
    profile: HostProfile,
    repository: Arc<dyn InstanceRepository>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(Envelope { command, ack }) = rx.recv().await {
        let reply = match profile.evaluate(&host, &command) {
            Err(AgentAckKind::Unsupported) => AgentAck::Unsupported,
            Err(AgentAckKind::Rejected(reason)) => {
                tracing::info!(%host, command = command.name(), %reason, "command rejected");
                AgentAck::Rejected { reason }
            }
            Ok(()) => {
                let (done, handle) = CompletionHandle::channel();
                tokio::spawn(apply_command(
                    profile,
                    Arc::clone(&repository),
                    command,
                    done,
                ));
                AgentAck::Accepted(handle)
            }
        };
        let _ = ack.send(reply);
    }
    tracing::debug!(%host, "host agent stopped");
}

async fn apply_command(
    profile: HostProfile,
    repository: Arc<dyn InstanceRepository>,
    command: AgentCommand,
    done: oneshot::Sender<Completion>,
) {
    if profile.apply_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(profile.apply_delay_ms)).await;
    }

    let name = command.name();
    let instance = command.instance().clone();
    let completion = if profile.fail_apply {
        Completion::Failed {
            reason: format!("hypervisor failed to apply {name}"),
        }
    } else {
        match repository.update(&instance, command.into_update()).await {
            Ok(_) => Completion::Applied,
            Err(e) => Completion::Failed {
                reason: e.to_string(),
            },
        }
    };

    tracing::debug!(%instance, command = name, ?completion, "command finished");
    let _ = done.send(completion);
}
