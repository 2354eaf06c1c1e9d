//! Flavor-changing tasks
//!
//! [`LiveResizeTask`] changes the flavor of a running or paused guest in
//! place; [`ResizeTask`] is the cold variant that also accepts a shut-off
//! guest. Rollback restores the pre-change shape: the prior flavor through a
//! compensating resize, then any hotplugged vCPU count or hottuned memory
//! that differed from that flavor.

use crate::error::TaskError;
use crate::task::{Task, TaskCore, TaskPhase};
use async_trait::async_trait;
use vmtune_compute::{ComputeServices, Reservation};
use vmtune_core::{
    ComputeError, Flavor, ImageRef, Instance, InstanceId, Operation, RequestContext, ResourceKind,
    TaskId,
};

/// Live resize of one instance
#[derive(Debug)]
pub struct LiveResizeTask {
    core: TaskCore,
    flavor: Flavor,
    image: Option<ImageRef>,
    prior: Option<Shape>,
}

impl LiveResizeTask {
    /// Create a pending task
    #[must_use]
    pub fn new(
        services: ComputeServices,
        ctx: RequestContext,
        image: Option<ImageRef>,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> Self {
        Self {
            core: TaskCore::new(Operation::LiveResize, services, ctx, instance, reservation),
            flavor,
            image,
            prior: None,
        }
    }

    /// Target flavor
    #[inline]
    #[must_use]
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// Flavor bound before execution, once known
    #[inline]
    #[must_use]
    pub fn prior_flavor(&self) -> Option<&Flavor> {
        self.prior.as_ref().map(|shape| &shape.flavor)
    }

    async fn run(&mut self) -> Result<(), ComputeError> {
        let instance = self.core.prepare().await?;
        self.prior = Some(Shape::of(&instance));

        let receipt = self
            .core
            .services
            .dispatcher()
            .live_resize(
                &instance,
                &self.flavor,
                self.image.as_ref(),
                self.core.reservation.as_ref(),
            )
            .await?;
        self.core.dispatched = true;

        self.core.await_applied(receipt).await?;
        self.core.complete().await
    }
}

#[async_trait]
impl Task for LiveResizeTask {
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
        self.core.release_hold(&mut failures).await;
        if let Some(prior) = self.prior.clone().filter(|_| self.core.dispatched) {
            if let Err(e) = restore_shape(&self.core, &prior, self.image.as_ref(), true).await {
                failures.push(format!("restoring shape: {e}"));
            }
        }
        self.core.settle_rollback(failures).await
    }
}

/// Cold resize of one instance
#[derive(Debug)]
pub struct ResizeTask {
    core: TaskCore,
    flavor: Flavor,
    prior: Option<Shape>,
}

impl ResizeTask {
    /// Create a pending task
    #[must_use]
    pub fn new(
        services: ComputeServices,
        ctx: RequestContext,
        instance: InstanceId,
        flavor: Flavor,
        reservation: Option<Reservation>,
    ) -> Self {
        Self {
            core: TaskCore::new(Operation::Resize, services, ctx, instance, reservation),
            flavor,
            prior: None,
        }
    }

    /// Target flavor
    #[inline]
    #[must_use]
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    async fn run(&mut self) -> Result<(), ComputeError> {
        let instance = self.core.prepare().await?;
        self.prior = Some(Shape::of(&instance));

        let receipt = self
            .core
            .services
            .dispatcher()
            .resize(&instance, &self.flavor, self.core.reservation.as_ref())
            .await?;
        self.core.dispatched = true;

        self.core.await_applied(receipt).await?;
        self.core.complete().await
    }
}

#[async_trait]
impl Task for ResizeTask {
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
        self.core.release_hold(&mut failures).await;
        if let Some(prior) = self.prior.clone().filter(|_| self.core.dispatched) {
            if let Err(e) = restore_shape(&self.core, &prior, None, false).await {
                failures.push(format!("restoring shape: {e}"));
            }
        }
        self.core.settle_rollback(failures).await
    }
}

/// Flavor and live resources of an instance before execution
#[derive(Debug, Clone, PartialEq, Eq)]
struct Shape {
    flavor: Flavor,
    vcpus: u32,
    memory_mb: u64,
}

impl Shape {
    fn of(instance: &Instance) -> Self {
        Self {
            flavor: instance.flavor.clone(),
            vcpus: instance.vcpus,
            memory_mb: instance.memory_mb,
        }
    }
}

/// Bring the stored record back to `prior`
///
/// Rebinding a flavor resets vCPUs and memory to the flavor's values, so
/// hot-changed resources are dispatched again afterwards.
async fn restore_shape(
    core: &TaskCore,
    prior: &Shape,
    image: Option<&ImageRef>,
    live: bool,
) -> Result<(), ComputeError> {
    let mut current = core.current().await?;
    if Shape::of(&current) == *prior {
        return Ok(());
    }

    let dispatcher = core.services.dispatcher();
    if current.flavor != prior.flavor {
        tracing::info!(
            task = %core.id,
            instance = %core.instance,
            from = %current.flavor.id,
            to = %prior.flavor.id,
            "restoring prior flavor"
        );
        let receipt = if live {
            dispatcher.live_resize(&current, &prior.flavor, image, None).await?
        } else {
            dispatcher.resize(&current, &prior.flavor, None).await?
        };
        core.await_applied(receipt).await?;
        current = core.current().await?;
    }

    for (kind, value) in [
        (ResourceKind::Vcpus, u64::from(prior.vcpus)),
        (ResourceKind::Memory, prior.memory_mb),
    ] {
        if current.value_of(kind) == value {
            continue;
        }
        tracing::info!(
            task = %core.id,
            instance = %core.instance,
            resource = kind.field(),
            value,
            "restoring prior value"
        );
        let receipt = dispatcher.dispatch(kind, &current, value).await?;
        core.await_applied(receipt).await?;
        current = core.current().await?;
    }
    Ok(())
}
