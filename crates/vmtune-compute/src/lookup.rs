//! Resource lookup gate
//!
//! Resolves an instance id to a record with a routable host.

use crate::repository::InstanceRepository;
use std::sync::Arc;
use vmtune_core::{ComputeError, Instance, InstanceId};

/// Resolves ids to instances, surfacing not-found and unknown-location
#[derive(Clone)]
pub struct ResourceLookupGate {
    repository: Arc<dyn InstanceRepository>,
}

impl ResourceLookupGate {
    /// Create gate over a repository
    #[inline]
    #[must_use]
    pub fn new(repository: Arc<dyn InstanceRepository>) -> Self {
        Self { repository }
    }

    /// Fetch the record whether or not its host is resolvable
    pub async fn get(&self, id: &InstanceId) -> Result<Instance, ComputeError> {
        self.repository.get(id).await
    }

    /// Fetch a record that can be routed to its host
    ///
    /// # Errors
    /// - `InstanceNotFound` if the id is unknown
    /// - `UnknownLocation` if the record has no host
    pub async fn locate(&self, id: &InstanceId) -> Result<Instance, ComputeError> {
        let instance = self.repository.get(id).await.inspect_err(|e| {
            tracing::debug!(instance = %id, error = %e, "lookup failed");
        })?;

        if instance.host.is_none() {
            tracing::warn!(instance = %id, "instance has no resolvable host");
            return Err(ComputeError::UnknownLocation { id: id.clone() });
        }

        Ok(instance)
    }
}

impl std::fmt::Debug for ResourceLookupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLookupGate").finish_non_exhaustive()
    }
}
