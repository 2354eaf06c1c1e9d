//! Quota reservations
//!
//! A [`Reservation`] is a move-only handle: `commit` and `rollback` both
//! consume it, so one handle can be released at most once. The service
//! additionally refuses ids it is not holding, which catches forged or
//! replayed handles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use vmtune_core::{ComputeError, ProjectId, ReservationId, ResourceDelta};

/// Held quota for one pending change
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: ReservationId,
    project: ProjectId,
    delta: ResourceDelta,
    created_at: DateTime<Utc>,
}

impl Reservation {
    /// Create a handle; only reservation services should call this
    #[must_use]
    pub fn new(project: ProjectId, delta: ResourceDelta) -> Self {
        Self {
            id: ReservationId::new(),
            project,
            delta,
            created_at: Utc::now(),
        }
    }

    /// Reservation id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// Charged project
    #[inline]
    #[must_use]
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Full signed delta applied on commit
    #[inline]
    #[must_use]
    pub fn delta(&self) -> ResourceDelta {
        self.delta
    }

    /// When the hold was taken
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Hold / commit / release contract
#[async_trait]
pub trait QuotaReservationService: Send + Sync {
    /// Hold quota for `delta`
    ///
    /// # Errors
    /// `QuotaExceeded` if the growth part does not fit
    async fn reserve(&self, project: &ProjectId, delta: ResourceDelta) -> Result<Reservation, ComputeError>;

    /// Convert the hold into usage
    async fn commit(&self, reservation: Reservation) -> Result<(), ComputeError>;

    /// Release the hold without changing usage
    async fn rollback(&self, reservation: Reservation) -> Result<(), ComputeError>;
}

/// Per-project limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    /// vCPU limit
    pub vcpus: i64,
    /// Memory limit in MiB
    pub memory_mb: i64,
}

impl QuotaLimits {
    /// Create limits
    #[inline]
    #[must_use]
    pub fn new(vcpus: i64, memory_mb: i64) -> Self {
        Self { vcpus, memory_mb }
    }

    /// Effectively unlimited
    #[inline]
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(i64::MAX, i64::MAX)
    }
}

/// Usage of one project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectUsage {
    /// Committed usage
    pub in_use: ResourceDelta,
    /// Held but not yet committed
    pub reserved: ResourceDelta,
}

/// Reservation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaStats {
    /// Holds taken
    pub reserved: usize,
    /// Holds committed
    pub committed: usize,
    /// Holds rolled back
    pub rolled_back: usize,
}

impl QuotaStats {
    /// Holds not yet released
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.reserved - self.committed - self.rolled_back
    }
}

/// In-memory quota engine
#[derive(Debug)]
pub struct InMemoryQuota {
    default_limits: QuotaLimits,
    limits: DashMap<ProjectId, QuotaLimits>,
    usage: Mutex<HashMap<ProjectId, ProjectUsage>>,
    held: DashMap<ReservationId, ResourceDelta>,
    stats: Mutex<QuotaStats>,
}

impl InMemoryQuota {
    /// Create engine with limits applied to every project
    #[must_use]
    pub fn new(default_limits: QuotaLimits) -> Self {
        Self {
            default_limits,
            limits: DashMap::new(),
            usage: Mutex::new(HashMap::new()),
            held: DashMap::new(),
            stats: Mutex::new(QuotaStats::default()),
        }
    }

    /// Override limits for one project
    pub fn set_limits(&self, project: ProjectId, limits: QuotaLimits) {
        self.limits.insert(project, limits);
    }

    /// Seed committed usage (e.g. from existing instances)
    pub fn add_usage(&self, project: ProjectId, delta: ResourceDelta) {
        let mut usage = self.usage.lock();
        let entry = usage.entry(project).or_default();
        entry.in_use.vcpus += delta.vcpus;
        entry.in_use.memory_mb += delta.memory_mb;
    }

    /// Current usage of a project
    #[must_use]
    pub fn usage(&self, project: &ProjectId) -> ProjectUsage {
        self.usage.lock().get(project).copied().unwrap_or_default()
    }

    /// Reservation counters
    #[must_use]
    pub fn stats(&self) -> QuotaStats {
        *self.stats.lock()
    }

    fn limits_for(&self, project: &ProjectId) -> QuotaLimits {
        self.limits
            .get(project)
            .map_or(self.default_limits, |l| *l.value())
    }

    fn release(&self, reservation: &Reservation) -> Result<ResourceDelta, ComputeError> {
        let (_, growth) = self.held.remove(&reservation.id).ok_or_else(|| {
            ComputeError::Reservation(format!("reservation {} is not held", reservation.id))
        })?;

        let mut usage = self.usage.lock();
        let entry = usage.entry(reservation.project.clone()).or_default();
        entry.reserved.vcpus -= growth.vcpus;
        entry.reserved.memory_mb -= growth.memory_mb;
        Ok(growth)
    }
}

impl Default for InMemoryQuota {
    fn default() -> Self {
        Self::new(QuotaLimits::unlimited())
    }
}

#[async_trait]
impl QuotaReservationService for InMemoryQuota {
    async fn reserve(&self, project: &ProjectId, delta: ResourceDelta) -> Result<Reservation, ComputeError> {
        let growth = delta.growth();
        let limits = self.limits_for(project);

        {
            let mut usage = self.usage.lock();
            let entry = usage.entry(project.clone()).or_default();

            let checks = [
                ("vcpus", growth.vcpus, limits.vcpus, entry.in_use.vcpus + entry.reserved.vcpus),
                (
                    "ram",
                    growth.memory_mb,
                    limits.memory_mb,
                    entry.in_use.memory_mb + entry.reserved.memory_mb,
                ),
            ];
            for (resource, requested, limit, used) in checks {
                let available = limit.saturating_sub(used);
                if requested > available {
                    tracing::info!(%project, resource, requested, available, "quota exceeded");
                    return Err(ComputeError::QuotaExceeded {
                        project: project.clone(),
                        resource,
                        requested,
                        available,
                    });
                }
            }

            entry.reserved.vcpus += growth.vcpus;
            entry.reserved.memory_mb += growth.memory_mb;
        }

        let reservation = Reservation::new(project.clone(), delta);
        self.held.insert(reservation.id, growth);
        self.stats.lock().reserved += 1;

        tracing::debug!(reservation = %reservation.id, %project, ?delta, "quota reserved");
        Ok(reservation)
    }

    async fn commit(&self, reservation: Reservation) -> Result<(), ComputeError> {
        self.release(&reservation)?;
        self.add_usage(reservation.project.clone(), reservation.delta);
        self.stats.lock().committed += 1;

        tracing::debug!(reservation = %reservation.id, "quota committed");
        Ok(())
    }

    async fn rollback(&self, reservation: Reservation) -> Result<(), ComputeError> {
        self.release(&reservation)?;
        self.stats.lock().rolled_back += 1;

        tracing::debug!(reservation = %reservation.id, "quota rolled back");
        Ok(())
    }
}
