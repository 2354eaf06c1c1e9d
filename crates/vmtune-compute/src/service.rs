//! Hot reconfiguration service
//!
//! Composes lookup, single-flight locking, the state guard, quota and the
//! dispatcher into the vCPU/memory change path:
//!
//! lookup → lease → fresh lookup → guard → value check → reserve → dispatch
//!
//! After acceptance the lease and reservation move to a completion watcher
//! that commits (or rolls back) the reservation and then frees the lease.

use crate::agent::{AgentChannel, Completion};
use crate::dispatcher::{DispatchReceipt, ReconfigurationDispatcher};
use crate::guard::StateGuard;
use crate::locks::{InstanceLease, InstanceLocks};
use crate::lookup::ResourceLookupGate;
use crate::quota::{QuotaReservationService, Reservation};
use crate::repository::InstanceRepository;
use std::sync::Arc;
use vmtune_core::{ComputeError, InstanceId, Operation, ReconfigurationRequest, ResourceKind};

/// Shared collaborators of the control plane
#[derive(Clone)]
pub struct ComputeServices {
    /// Instance storage
    pub repository: Arc<dyn InstanceRepository>,
    /// Quota engine
    pub quota: Arc<dyn QuotaReservationService>,
    /// Agent messaging
    pub agents: Arc<dyn AgentChannel>,
    /// Per-instance single-flight registry
    pub locks: Arc<InstanceLocks>,
    /// Lifecycle state guard
    pub guard: Arc<StateGuard>,
}

impl ComputeServices {
    /// Bundle collaborators with the default guard
    #[must_use]
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        quota: Arc<dyn QuotaReservationService>,
        agents: Arc<dyn AgentChannel>,
        locks: Arc<InstanceLocks>,
    ) -> Self {
        Self {
            repository,
            quota,
            agents,
            locks,
            guard: Arc::new(StateGuard::new()),
        }
    }

    /// With a custom state guard
    #[must_use]
    pub fn with_guard(mut self, guard: StateGuard) -> Self {
        self.guard = Arc::new(guard);
        self
    }

    /// Lookup gate over the repository
    #[must_use]
    pub fn lookup(&self) -> ResourceLookupGate {
        ResourceLookupGate::new(Arc::clone(&self.repository))
    }

    /// Dispatcher over the agent channel
    #[must_use]
    pub fn dispatcher(&self) -> ReconfigurationDispatcher {
        ReconfigurationDispatcher::new(Arc::clone(&self.agents))
    }
}

impl std::fmt::Debug for ComputeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeServices")
            .field("locks", &self.locks)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Accepted change; completion is observed through later reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Instance being changed
    pub instance: InstanceId,
    /// Operation accepted
    pub operation: Operation,
    /// Requested value
    pub requested: u64,
}

/// vCPU hotplug and memory hottune
#[derive(Debug, Clone)]
pub struct ReconfigurationService {
    services: ComputeServices,
    lookup: ResourceLookupGate,
    dispatcher: ReconfigurationDispatcher,
}

impl ReconfigurationService {
    /// Create service over shared collaborators
    #[must_use]
    pub fn new(services: ComputeServices) -> Self {
        Self {
            lookup: services.lookup(),
            dispatcher: services.dispatcher(),
            services,
        }
    }

    /// Shared collaborators
    #[inline]
    #[must_use]
    pub fn services(&self) -> &ComputeServices {
        &self.services
    }

    /// Stored value of `kind` for `id`, read verbatim
    pub async fn current_value(&self, id: &InstanceId, kind: ResourceKind) -> Result<u64, ComputeError> {
        Ok(self.lookup.get(id).await?.value_of(kind))
    }

    /// Request a hot change of one resource
    ///
    /// Returns once the hosting agent accepted the command. The stored value
    /// changes only when the agent applies it.
    ///
    /// # Errors
    /// - `InstanceNotFound` / `UnknownLocation` before any side effect
    /// - `InstanceBusy` if another change of the instance does not finish in time
    /// - `InvalidState` if the lifecycle state forbids the change
    /// - `Validation` if the value equals the current one
    /// - `QuotaExceeded` if the hold cannot be taken
    /// - `SetFailed` / `NotSupported` from the agent; the hold is released first
    pub async fn reconfigure(
        &self,
        id: &InstanceId,
        request: ReconfigurationRequest,
    ) -> Result<Accepted, ComputeError> {
        let operation = request.kind.operation();

        // Not-found and unknown-location surface before taking any resource.
        self.lookup.locate(id).await?;

        let lease = self.services.locks.acquire(id).await?;
        let instance = self.lookup.locate(id).await?;
        self.services.guard.check(&instance, operation)?;

        let current = instance.value_of(request.kind);
        if request.value == current {
            return Err(ComputeError::Validation(format!(
                "instance {id} already has {} {}",
                request.value, request.kind
            )));
        }

        let reservation = self
            .services
            .quota
            .reserve(&instance.project_id, request.delta_for(&instance))
            .await?;

        let receipt = match self
            .dispatcher
            .dispatch(request.kind, &instance, request.value)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                release_reservation(self.services.quota.as_ref(), reservation, false).await;
                return Err(e);
            }
        };

        tracing::info!(
            instance = %id,
            %operation,
            from = current,
            to = request.value,
            "reconfiguration accepted"
        );

        tokio::spawn(finish_when_complete(
            receipt,
            reservation,
            lease,
            Arc::clone(&self.services.quota),
            Arc::clone(&self.services.locks),
        ));

        Ok(Accepted {
            instance: id.clone(),
            operation,
            requested: request.value,
        })
    }

    /// Wait until no reconfiguration of `id` is in flight
    pub async fn quiesce(&self, id: &InstanceId) {
        self.services.locks.quiesce(id).await;
    }
}

async fn finish_when_complete(
    receipt: DispatchReceipt,
    reservation: Reservation,
    lease: InstanceLease,
    quota: Arc<dyn QuotaReservationService>,
    locks: Arc<InstanceLocks>,
) {
    let instance = receipt.instance().clone();
    let operation = receipt.operation();
    let completion = receipt.completion().await;

    match &completion {
        Completion::Applied => {
            tracing::info!(%instance, %operation, "reconfiguration applied");
        }
        Completion::Failed { reason } => {
            tracing::warn!(%instance, %operation, %reason, "reconfiguration failed on agent");
        }
    }
    release_reservation(quota.as_ref(), reservation, completion.is_applied()).await;

    drop(lease);
    locks.prune();
}

/// Release a hold on its single terminal transition, logging failures
pub async fn release_reservation(
    quota: &dyn QuotaReservationService,
    reservation: Reservation,
    commit: bool,
) {
    let id = reservation.id();
    let result = if commit {
        quota.commit(reservation).await
    } else {
        quota.rollback(reservation).await
    };
    if let Err(e) = result {
        tracing::error!(reservation = %id, commit, error = %e, "failed to release reservation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentBus, HostProfile};
    use crate::quota::{InMemoryQuota, QuotaLimits};
    use crate::repository::InMemoryInstanceRepository;
    use std::time::Duration;
    use vmtune_core::{Flavor, Instance, PowerState};

    struct Fixture {
        repo: Arc<InMemoryInstanceRepository>,
        quota: Arc<InMemoryQuota>,
        service: ReconfigurationService,
    }

    fn fixture(profile: HostProfile) -> Fixture {
        let flavor = Flavor::new("m1.small", 2, 2048);
        let repo = Arc::new(InMemoryInstanceRepository::new());
        repo.insert(Instance::new("A", "p1", flavor.clone()).with_host("node-1"));
        repo.insert(
            Instance::new("B", "p1", flavor)
                .with_host("node-1")
                .with_power_state(PowerState::Shutdown),
        );

        let quota = Arc::new(InMemoryQuota::new(QuotaLimits::new(16, 32 * 1024)));
        let bus = AgentBus::new(repo.clone(), 8);
        bus.register_host("node-1", profile);

        let services = ComputeServices::new(
            repo.clone(),
            quota.clone(),
            Arc::new(bus),
            Arc::new(InstanceLocks::new(Duration::from_millis(200))),
        );
        Fixture {
            repo,
            quota,
            service: ReconfigurationService::new(services),
        }
    }

    #[tokio::test]
    async fn accepted_change_lands_after_quiesce() {
        let fx = fixture(HostProfile::default());
        let id = InstanceId::from("A");

        let accepted = fx
            .service
            .reconfigure(&id, ReconfigurationRequest::new(ResourceKind::Vcpus, 4))
            .await
            .unwrap();
        assert_eq!(accepted.operation, Operation::SetVcpus);

        fx.service.quiesce(&id).await;
        assert_eq!(fx.service.current_value(&id, ResourceKind::Vcpus).await.unwrap(), 4);
        assert_eq!(fx.quota.stats().committed, 1);
        assert_eq!(fx.quota.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn shutdown_instance_is_refused_without_side_effects() {
        let fx = fixture(HostProfile::default());
        let id = InstanceId::from("B");

        let err = fx
            .service
            .reconfigure(&id, ReconfigurationRequest::new(ResourceKind::Memory, 4096))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(fx.repo.get(&id).await.unwrap().memory_mb, 2048);
        assert_eq!(fx.quota.stats().reserved, 0);
    }

    #[tokio::test]
    async fn same_value_is_validation_error() {
        let fx = fixture(HostProfile::default());
        let err = fx
            .service
            .reconfigure(&"A".into(), ReconfigurationRequest::new(ResourceKind::Vcpus, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Validation(_)));
    }

    #[tokio::test]
    async fn agent_rejection_releases_hold_once() {
        let fx = fixture(HostProfile::default());
        let err = fx
            .service
            .reconfigure(&"A".into(), ReconfigurationRequest::new(ResourceKind::Vcpus, 33))
            .await
            .unwrap_err();

        assert!(matches!(err, ComputeError::SetFailed { .. }));
        let stats = fx.quota.stats();
        assert_eq!((stats.reserved, stats.rolled_back, stats.committed), (1, 1, 0));
    }

    #[tokio::test]
    async fn apply_failure_rolls_hold_back() {
        let fx = fixture(HostProfile::default().failing());
        let id = InstanceId::from("A");

        fx.service
            .reconfigure(&id, ReconfigurationRequest::new(ResourceKind::Memory, 4096))
            .await
            .unwrap();
        fx.service.quiesce(&id).await;

        assert_eq!(fx.repo.get(&id).await.unwrap().memory_mb, 2048);
        assert_eq!(fx.quota.stats().rolled_back, 1);
        assert_eq!(fx.quota.stats().outstanding(), 0);
    }
}
