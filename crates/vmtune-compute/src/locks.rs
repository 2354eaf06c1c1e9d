//! Per-instance single-flight registry
//!
//! At most one reconfiguration per instance is in flight. A lease is taken
//! before the state guard runs and is held until the agent reports
//! completion or the owning task rolls back.
//!
//! A task whose rollback fails parks its lease with [`InstanceLocks::fence`];
//! the instance then refuses new leases until [`InstanceLocks::lift_fence`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use vmtune_core::{ComputeError, InstanceId};

/// Exclusive right to reconfigure one instance
#[derive(Debug)]
pub struct InstanceLease {
    instance: InstanceId,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceLease {
    /// Leased instance
    #[inline]
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }
}

/// Keyed lock registry
#[derive(Debug)]
pub struct InstanceLocks {
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    fenced: DashMap<InstanceId, InstanceLease>,
    wait: Duration,
}

impl InstanceLocks {
    /// Create registry; `wait` bounds how long an acquirer queues
    #[inline]
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            fenced: DashMap::new(),
            wait,
        }
    }

    /// Acquire the lease for `id`
    ///
    /// # Errors
    /// `InstanceBusy` when the current holder keeps it past the wait, or at
    /// once while the instance is fenced
    pub async fn acquire(&self, id: &InstanceId) -> Result<InstanceLease, ComputeError> {
        if self.is_fenced(id) {
            tracing::info!(instance = %id, "instance fenced");
            return Err(ComputeError::InstanceBusy { id: id.clone() });
        }
        let lock = self.slot(id);
        match tokio::time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => {
                tracing::trace!(instance = %id, "lease acquired");
                Ok(InstanceLease {
                    instance: id.clone(),
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::info!(instance = %id, wait_ms = self.wait.as_millis(), "instance busy");
                Err(ComputeError::InstanceBusy { id: id.clone() })
            }
        }
    }

    /// Whether a lease on `id` is currently held
    #[must_use]
    pub fn is_held(&self, id: &InstanceId) -> bool {
        let Some(lock) = self.locks.get(id).map(|slot| Arc::clone(slot.value())) else {
            return false;
        };
        let held = lock.try_lock().is_err();
        held
    }

    /// Wait, without bound, until no lease on `id` is held
    ///
    /// Returns at once for fenced instances and for ids without a slot.
    pub async fn quiesce(&self, id: &InstanceId) {
        if self.is_fenced(id) {
            return;
        }
        let Some(lock) = self.locks.get(id).map(|slot| Arc::clone(slot.value())) else {
            return;
        };
        drop(lock.lock().await);
        drop(lock);
        self.prune();
    }

    /// Keep `lease` held until [`lift_fence`](Self::lift_fence)
    ///
    /// Used when an instance is left in an unknown state and must not be
    /// reconfigured before it is reconciled.
    pub fn fence(&self, lease: InstanceLease) {
        tracing::warn!(instance = %lease.instance, "instance fenced for reconciliation");
        self.fenced.insert(lease.instance.clone(), lease);
    }

    /// Release a fenced lease; `false` if `id` was not fenced
    pub fn lift_fence(&self, id: &InstanceId) -> bool {
        let lifted = self.fenced.remove(id).is_some();
        if lifted {
            tracing::info!(instance = %id, "fence lifted");
            self.prune();
        }
        lifted
    }

    /// Whether `id` is fenced
    #[inline]
    #[must_use]
    pub fn is_fenced(&self, id: &InstanceId) -> bool {
        self.fenced.contains_key(id)
    }

    /// Drop registry slots nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of registry slots
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the registry has no slots
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn slot(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for InstanceLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
