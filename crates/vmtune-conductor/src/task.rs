//! Task contract for deferred multi-step operations
//!
//! A task moves `pending → executing` exactly once and ends `completed`,
//! `failed` or `rolled_back`. Rollback has no default: every variant states
//! how it undoes a partial execution.

use crate::error::TaskError;
use crate::migrate::MigrateTask;
use crate::resize::{LiveResizeTask, ResizeTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vmtune_compute::{
    ComputeServices, Completion, DispatchReceipt, InstanceLease, InstanceUpdate, Reservation,
};
use vmtune_core::{ComputeError, Instance, InstanceId, Operation, RequestContext, TaskId};

/// Lifecycle phase of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Constructed, not yet executed
    Pending,
    /// Execution started
    Executing,
    /// Change applied and committed
    Completed,
    /// Execution (or a rollback attempt) failed
    Failed,
    /// Partial execution undone
    RolledBack,
}

impl TaskPhase {
    /// Wire/log name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Pending => "pending",
            TaskPhase::Executing => "executing",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
            TaskPhase::RolledBack => "rolled_back",
        }
    }

    /// Whether rollback can do anything useful from here
    #[inline]
    #[must_use]
    pub fn can_roll_back(&self) -> bool {
        matches!(self, TaskPhase::Executing | TaskPhase::Failed)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task id
    pub id: TaskId,
    /// Operation performed
    pub operation: Operation,
    /// Target instance
    pub instance: InstanceId,
    /// Phase at the time of the snapshot
    pub phase: TaskPhase,
}

/// Execute/rollback contract
#[async_trait]
pub trait Task: Send {
    /// Task id
    fn id(&self) -> TaskId;

    /// Operation this task performs
    fn operation(&self) -> Operation;

    /// Target instance
    fn instance(&self) -> &InstanceId;

    /// Current phase
    fn phase(&self) -> TaskPhase;

    /// Guard, dispatch and wait for the agent's completion report
    ///
    /// # Errors
    /// - `AlreadyExecuted` if the task left `pending` before
    /// - `Compute` for any lookup, guard, dispatch or quota failure
    async fn execute(&mut self) -> Result<(), TaskError>;

    /// Undo a partial execution
    ///
    /// # Errors
    /// - `InvalidPhase` from `pending`, `completed` or `rolled_back`
    /// - `RollbackFailed` if the pre-change state could not be restored
    async fn rollback(&mut self) -> Result<(), TaskError>;

    /// Snapshot for reporting
    fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id(),
            operation: self.operation(),
            instance: self.instance().clone(),
            phase: self.phase(),
        }
    }
}

/// The closed set of task variants
#[derive(Debug)]
pub enum TaskKind {
    /// Flavor change while running
    LiveResize(LiveResizeTask),
    /// Cold flavor change
    Resize(ResizeTask),
    /// Move to another host
    Migrate(MigrateTask),
}

macro_rules! delegate {
    ($self:ident, $task:ident => $body:expr) => {
        match $self {
            TaskKind::LiveResize($task) => $body,
            TaskKind::Resize($task) => $body,
            TaskKind::Migrate($task) => $body,
        }
    };
}

#[async_trait]
impl Task for TaskKind {
    fn id(&self) -> TaskId {
        delegate!(self, task => task.id())
    }

    fn operation(&self) -> Operation {
        delegate!(self, task => task.operation())
    }

    fn instance(&self) -> &InstanceId {
        delegate!(self, task => task.instance())
    }

    fn phase(&self) -> TaskPhase {
        delegate!(self, task => task.phase())
    }

    async fn execute(&mut self) -> Result<(), TaskError> {
        delegate!(self, task => task.execute().await)
    }

    async fn rollback(&mut self) -> Result<(), TaskError> {
        delegate!(self, task => task.rollback().await)
    }
}

impl From<LiveResizeTask> for TaskKind {
    fn from(task: LiveResizeTask) -> Self {
        TaskKind::LiveResize(task)
    }
}

impl From<ResizeTask> for TaskKind {
    fn from(task: ResizeTask) -> Self {
        TaskKind::Resize(task)
    }
}

impl From<MigrateTask> for TaskKind {
    fn from(task: MigrateTask) -> Self {
        TaskKind::Migrate(task)
    }
}

/// State and steps shared by every variant
#[derive(Debug)]
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) operation: Operation,
    pub(crate) ctx: RequestContext,
    pub(crate) instance: InstanceId,
    pub(crate) services: ComputeServices,
    pub(crate) reservation: Option<Reservation>,
    pub(crate) phase: TaskPhase,
    /// An agent accepted the forward command
    pub(crate) dispatched: bool,
    lease: Option<InstanceLease>,
    marked: bool,
}

impl TaskCore {
    pub(crate) fn new(
        operation: Operation,
        services: ComputeServices,
        ctx: RequestContext,
        instance: InstanceId,
        reservation: Option<Reservation>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            operation,
            ctx,
            instance,
            services,
            reservation,
            phase: TaskPhase::Pending,
            dispatched: false,
            lease: None,
            marked: false,
        }
    }

    pub(crate) fn begin(&mut self) -> Result<(), TaskError> {
        if self.phase != TaskPhase::Pending {
            return Err(TaskError::AlreadyExecuted { task: self.id });
        }
        self.phase = TaskPhase::Executing;
        tracing::info!(
            task = %self.id,
            instance = %self.instance,
            operation = %self.operation,
            request = %self.ctx.request_id,
            user = %self.ctx.user_id,
            "task executing"
        );
        Ok(())
    }

    /// Lease, fresh lookup, guard and in-flight marker
    pub(crate) async fn prepare(&mut self) -> Result<Instance, ComputeError> {
        let lookup = self.services.lookup();
        lookup.locate(&self.instance).await?;

        self.lease = Some(self.services.locks.acquire(&self.instance).await?);
        let instance = lookup.locate(&self.instance).await?;
        self.services.guard.check(&instance, self.operation)?;

        self.services
            .repository
            .update(
                &self.instance,
                InstanceUpdate::TaskState(Some(self.operation.in_flight_state())),
            )
            .await?;
        self.marked = true;
        Ok(instance)
    }

    pub(crate) async fn await_applied(&self, receipt: DispatchReceipt) -> Result<(), ComputeError> {
        let operation = receipt.operation();
        match receipt.completion().await {
            Completion::Applied => Ok(()),
            Completion::Failed { reason } => Err(ComputeError::SetFailed {
                id: self.instance.clone(),
                operation,
                reason,
            }),
        }
    }

    /// Clear the marker, commit the hold and free the lease
    pub(crate) async fn complete(&mut self) -> Result<(), ComputeError> {
        self.services
            .repository
            .update(&self.instance, InstanceUpdate::TaskState(None))
            .await?;
        self.marked = false;

        if let Some(reservation) = self.reservation.take() {
            self.services.quota.commit(reservation).await?;
        }

        self.lease = None;
        self.services.locks.prune();
        self.phase = TaskPhase::Completed;
        tracing::info!(task = %self.id, instance = %self.instance, "task completed");
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: ComputeError) -> TaskError {
        self.phase = TaskPhase::Failed;
        tracing::warn!(
            task = %self.id,
            instance = %self.instance,
            operation = %self.operation,
            error = %error,
            "task failed"
        );
        TaskError::Compute(error)
    }

    pub(crate) fn ensure_rollback_allowed(&self) -> Result<(), TaskError> {
        if self.phase.can_roll_back() {
            Ok(())
        } else {
            Err(TaskError::InvalidPhase {
                task: self.id,
                phase: self.phase,
                action: "rollback",
            })
        }
    }

    /// Stored record, read verbatim
    pub(crate) async fn current(&self) -> Result<Instance, ComputeError> {
        self.services.lookup().locate(&self.instance).await
    }

    pub(crate) async fn release_hold(&mut self, failures: &mut Vec<String>) {
        if let Some(reservation) = self.reservation.take() {
            let id = reservation.id();
            if let Err(e) = self.services.quota.rollback(reservation).await {
                failures.push(format!("release of reservation {id}: {e}"));
            }
        }
    }

    async fn clear_marker(&mut self, failures: &mut Vec<String>) {
        if !self.marked {
            return;
        }
        match self
            .services
            .repository
            .update(&self.instance, InstanceUpdate::TaskState(None))
            .await
        {
            Ok(_) => self.marked = false,
            Err(e) => failures.push(format!("clearing task state: {e}")),
        }
    }

    /// Close a rollback
    ///
    /// With no failures the marker is cleared and the lease freed. Otherwise
    /// the instance keeps its marker and the lease is fenced, so nothing else
    /// reconfigures it before it is reconciled.
    pub(crate) async fn settle_rollback(&mut self, mut failures: Vec<String>) -> Result<(), TaskError> {
        if failures.is_empty() {
            self.clear_marker(&mut failures).await;
        }
        if failures.is_empty() {
            self.lease = None;
            self.services.locks.prune();
            self.phase = TaskPhase::RolledBack;
            tracing::info!(task = %self.id, instance = %self.instance, "task rolled back");
            return Ok(());
        }

        self.phase = TaskPhase::Failed;
        let reason = failures.join("; ");
        tracing::error!(task = %self.id, instance = %self.instance, %reason, "rollback failed");

        if let Some(lease) = self.lease.take() {
            if !self.marked {
                let marker = InstanceUpdate::TaskState(Some(self.operation.in_flight_state()));
                match self.services.repository.update(&self.instance, marker).await {
                    Ok(_) => self.marked = true,
                    Err(e) => tracing::warn!(instance = %self.instance, error = %e, "could not re-mark instance"),
                }
            }
            self.services.locks.fence(lease);
        }

        Err(TaskError::RollbackFailed {
            task: self.id,
            reason,
            original: None,
        })
    }
}
