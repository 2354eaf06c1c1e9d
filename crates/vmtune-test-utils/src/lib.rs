//! Testing utilities for vmtune workspace
//!
//! Shared fleets, flavors and a wired-up in-memory control plane.
//! Building a [`Harness`] spawns host agents, so it must run inside a
//! tokio runtime.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;
use vmtune_compute::{
    AgentBus, ComputeServices, HostProfile, InMemoryInstanceRepository, InMemoryQuota,
    InstanceLocks, InstanceRepository, QuotaLimits,
};
use vmtune_core::{Flavor, HostRef, Instance, InstanceId, PowerState};

pub const PROJECT: &str = "p1";
pub const HOST: &str = "node-1";
pub const OTHER_HOST: &str = "node-2";

pub fn small_flavor() -> Flavor {
    Flavor::new("m1.small", 2, 2048).with_root_gb(20)
}

pub fn large_flavor() -> Flavor {
    Flavor::new("m1.large", 4, 8192).with_root_gb(40)
}

pub fn running_instance(id: &str) -> Instance {
    Instance::new(id, PROJECT, small_flavor()).with_host(HOST)
}

pub fn shutdown_instance(id: &str) -> Instance {
    running_instance(id).with_power_state(PowerState::Shutdown)
}

pub struct Harness {
    pub repo: Arc<InMemoryInstanceRepository>,
    pub quota: Arc<InMemoryQuota>,
    pub bus: Arc<AgentBus>,
    pub locks: Arc<InstanceLocks>,
    pub services: ComputeServices,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// A (running) and B (shutdown) on node-1; node-1 and node-2 registered
    pub fn standard() -> Self {
        Self::builder()
            .instance(running_instance("A"))
            .instance(shutdown_instance("B"))
            .host(HOST, HostProfile::default())
            .host(OTHER_HOST, HostProfile::default())
            .build()
    }

    pub async fn instance(&self, id: &str) -> Instance {
        self.repo.get(&InstanceId::from(id)).await.unwrap()
    }

    pub async fn quiesce(&self, id: &str) {
        self.locks.quiesce(&InstanceId::from(id)).await;
    }
}

pub struct HarnessBuilder {
    instances: Vec<Instance>,
    hosts: Vec<(HostRef, HostProfile)>,
    limits: QuotaLimits,
    lock_wait: Duration,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            hosts: Vec::new(),
            limits: QuotaLimits::new(16, 32 * 1024),
            lock_wait: Duration::from_millis(200),
        }
    }
}

impl HarnessBuilder {
    pub fn instance(mut self, instance: Instance) -> Self {
        self.instances.push(instance);
        self
    }

    pub fn host(mut self, host: &str, profile: HostProfile) -> Self {
        self.hosts.push((HostRef::from(host), profile));
        self
    }

    pub fn limits(mut self, limits: QuotaLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn build(self) -> Harness {
        let repo: Arc<InMemoryInstanceRepository> = Arc::new(self.instances.into_iter().collect());
        let quota = Arc::new(InMemoryQuota::new(self.limits));
        let bus = Arc::new(AgentBus::new(repo.clone(), 16));
        for (host, profile) in self.hosts {
            bus.register_host(host, profile);
        }
        let locks = Arc::new(InstanceLocks::new(self.lock_wait));

        let services = ComputeServices::new(repo.clone(), quota.clone(), bus.clone(), locks.clone());
        Harness {
            repo,
            quota,
            bus,
            locks,
            services,
        }
    }
}
