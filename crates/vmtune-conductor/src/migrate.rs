//! Migration task

use crate::error::TaskError;
use crate::task::{Task, TaskCore, TaskPhase};
use async_trait::async_trait;
use vmtune_compute::ComputeServices;
use vmtune_core::{ComputeError, HostRef, InstanceId, Operation, RequestContext, TaskId};

/// Move one instance to another host
///
/// Rollback moves the instance back when the stored record already names
/// the destination.
#[derive(Debug)]
pub struct MigrateTask {
    core: TaskCore,
    destination: HostRef,
    source: Option<HostRef>,
}

impl MigrateTask {
    /// Create a pending task
    #[must_use]
    pub fn new(
        services: ComputeServices,
        ctx: RequestContext,
        instance: InstanceId,
        destination: HostRef,
    ) -> Self {
        Self {
            core: TaskCore::new(Operation::Migrate, services, ctx, instance, None),
            destination,
            source: None,
        }
    }

    /// Destination host
    #[inline]
    #[must_use]
    pub fn destination(&self) -> &HostRef {
        &self.destination
    }

    /// Host the instance ran on before execution, once known
    #[inline]
    #[must_use]
    pub fn source(&self) -> Option<&HostRef> {
        self.source.as_ref()
    }

    async fn run(&mut self) -> Result<(), ComputeError> {
        let instance = self.core.prepare().await?;
        self.source = instance.host.clone();

        let receipt = self
            .core
            .services
            .dispatcher()
            .migrate(&instance, &self.destination)
            .await?;
        self.core.dispatched = true;

        self.core.await_applied(receipt).await?;
        self.core.complete().await
    }

    async fn restore_host(&self, source: HostRef) -> Result<(), ComputeError> {
        let current = self.core.current().await?;
        if current.host.as_ref() == Some(&source) {
            return Ok(());
        }

        tracing::info!(
            task = %self.core.id,
            instance = %self.core.instance,
            %source,
            "moving instance back to source host"
        );
        let receipt = self
            .core
            .services
            .dispatcher()
            .migrate(&current, &source)
            .await?;
        self.core.await_applied(receipt).await
    }
}

#[async_trait]
impl Task for MigrateTask {
    fn id(&self) -> TaskId {
        self.core.id
    }

    fn operation(&self) -> Operation {
        self.core.operation
    }

    fn instance(&self) -> &InstanceId {
        &self.core.instance
    }

    fn phase(&self) -> TaskPhase {
        self.core.phase
    }

    async fn execute(&mut self) -> Result<(), TaskError> {
        self.core.begin()?;
        let result = self.run().await;
        result.map_err(|e| self.core.fail(e))
    }

    async fn rollback(&mut self) -> Result<(), TaskError> {
        self.core.ensure_rollback_allowed()?;

        let mut failures = Vec::new();
        if let Some(source) = self.source.clone().filter(|_| self.core.dispatched) {
            if let Err(e) = self.restore_host(source).await {
                failures.push(format!("restoring host: {e}"));
            }
        }
        self.core.settle_rollback(failures).await
    }
}
