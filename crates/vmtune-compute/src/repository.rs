//! Instance persistence seam
//!
//! The real store lives outside this workspace; [`InMemoryInstanceRepository`]
//! backs tests and the CLI.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use vmtune_core::{ComputeError, Flavor, HostRef, Instance, InstanceId, ResourceKind, TaskState};

/// A single mutation of a stored instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceUpdate {
    /// Set or clear the in-flight task marker
    TaskState(Option<TaskState>),
    /// Record an applied vCPU or memory change
    Resource {
        /// Resource changed
        kind: ResourceKind,
        /// New value
        value: u64,
    },
    /// Bind a new flavor (resizes vcpus and memory)
    Flavor(Flavor),
    /// Move to another host
    Host(HostRef),
}

impl InstanceUpdate {
    fn apply(self, instance: &mut Instance) {
        match self {
            InstanceUpdate::TaskState(state) => instance.task_state = state,
            InstanceUpdate::Resource { kind, value } => match kind {
                ResourceKind::Vcpus => {
                    instance.vcpus = u32::try_from(value).unwrap_or(u32::MAX);
                }
                ResourceKind::Memory => instance.memory_mb = value,
            },
            InstanceUpdate::Flavor(flavor) => instance.bind_flavor(flavor),
            InstanceUpdate::Host(host) => instance.host = Some(host),
        }
    }
}

/// Instance storage consumed by the control plane
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Fetch a record; `InstanceNotFound` if the id is unknown
    async fn get(&self, id: &InstanceId) -> Result<Instance, ComputeError>;

    /// Apply a mutation and return the stored result
    async fn update(&self, id: &InstanceId, update: InstanceUpdate) -> Result<Instance, ComputeError>;
}

/// Concurrent in-memory store
#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    instances: DashMap<InstanceId, Instance>,
}

impl InMemoryInstanceRepository {
    /// Create empty repository
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn insert(&self, instance: Instance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    /// Snapshot of every record, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the repository is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl FromIterator<Instance> for InMemoryInstanceRepository {
    fn from_iter<I: IntoIterator<Item = Instance>>(iter: I) -> Self {
        let repo = Self::new();
        for instance in iter {
            repo.insert(instance);
        }
        repo
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn get(&self, id: &InstanceId) -> Result<Instance, ComputeError> {
        self.instances
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ComputeError::InstanceNotFound { id: id.clone() })
    }

    async fn update(&self, id: &InstanceId, update: InstanceUpdate) -> Result<Instance, ComputeError> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| ComputeError::InstanceNotFound { id: id.clone() })?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }
}
