//! Conductor
//!
//! Builds tasks and runs them through [`Conductor::safe_execute`]:
//! - execute the task
//! - on failure, roll it back
//! - surface the execution error, or `RollbackFailed` carrying it when
//!   recovery itself fails

use crate::error::TaskError;
use crate::migrate::MigrateTask;
use crate::resize::{LiveResizeTask, ResizeTask};
use crate::task::{Task, TaskKind, TaskSummary};
use vmtune_compute::{ComputeServices, Reservation};
use vmtune_core::{
    ComputeError, Flavor, HostRef, ImageRef, InstanceId, RequestContext, ResourceDelta,
};

/// Orchestrates deferred operations against compute hosts
#[derive(Debug, Clone)]
pub struct Conductor {
    services: ComputeServices,
}

impl Conductor {
    /// Create conductor over shared collaborators
    #[inline]
    #[must_use]
    pub fn new(services: ComputeServices) -> Self {
        Self { services }
    }

    /// Shared collaborators
    #[inline]
    #[must_use]
    pub fn services(&self) -> &ComputeServices {
        &self.services
    }

    /// Hold quota for moving `instance` onto `flavor`
    ///
    /// The delta runs from the instance's live vCPUs and memory, not from
    /// its bound flavor.
    ///
    /// # Errors
    /// `InstanceNotFound` or `QuotaExceeded`
    pub async fn reserve_for_flavor(
        &self,
        instance: &InstanceId,
        flavor: &Flavor,
    ) -> Result<Reservation, ComputeError> {
        let current = self.services.lookup().get(instance).await?;
        let delta = ResourceDelta::resizing(&current, flavor);
        self.services.quota.reserve(&current.project_id, delta).await
    }

    /// Build a pending live resize task
    #[must_use]
    pub fn live_resize_task(
        &self,
        ctx: RequestContext,
        image: Option<ImageRef>,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> TaskKind {
        LiveResizeTask::new(self.services.clone(), ctx, image, instance, flavor, reservation).into()
    }

    /// Build a pending cold resize task
    #[must_use]
    pub fn resize_task(
        &self,
        ctx: RequestContext,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> TaskKind {
        ResizeTask::new(self.services.clone(), ctx, instance, flavor, reservation).into()
    }

    /// Build a pending migration task
    #[must_use]
    pub fn migrate_task(
        &self,
        ctx: RequestContext,
        instance: InstanceId,
        destination: HostRef,
    ) -> TaskKind {
        MigrateTask::new(self.services.clone(), ctx, instance, destination).into()
    }

    /// Live-resize `instance` to `flavor`
    pub async fn live_resize(
        &self,
        ctx: RequestContext,
        image: Option<ImageRef>,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> Result<TaskSummary, TaskError> {
        let mut task = self.live_resize_task(ctx, image, instance, flavor, reservation);
        self.safe_execute(&mut task).await?;
        Ok(task.summary())
    }

    /// Cold-resize `instance` to `flavor`
    pub async fn resize(
        &self,
        ctx: RequestContext,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> Result<TaskSummary, TaskError> {
        let mut task = self.resize_task(ctx, instance, flavor, reservation);
        self.safe_execute(&mut task).await?;
        Ok(task.summary())
    }

    /// Move `instance` to `destination`
    pub async fn migrate(
        &self,
        ctx: RequestContext,
        instance: InstanceId,
        destination: HostRef,
    ) -> Result<TaskSummary, TaskError> {
        let mut task = self.migrate_task(ctx, instance, destination);
        self.safe_execute(&mut task).await?;
        Ok(task.summary())
    }

    /// Execute `task`, rolling it back if execution fails
    ///
    /// # Errors
    /// - The execution error once rollback succeeded
    /// - `RollbackFailed` carrying the execution error otherwise
    /// - `AlreadyExecuted` without touching the task
    pub async fn safe_execute<T: Task + ?Sized>(&self, task: &mut T) -> Result<(), TaskError> {
        let error = match task.execute().await {
            Ok(()) => return Ok(()),
            Err(e @ (TaskError::AlreadyExecuted { .. } | TaskError::InvalidPhase { .. })) => {
                return Err(e)
            }
            Err(e) => e,
        };

        tracing::warn!(
            task = %task.id(),
            instance = %task.instance(),
            operation = %task.operation(),
            %error,
            "execution failed, rolling back"
        );
        match task.rollback().await {
            Ok(()) => Err(error),
            Err(rollback) => Err(rollback.with_original(error)),
        }
    }
}
