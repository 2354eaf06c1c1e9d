//! Fleet description
//!
//! A TOML file naming hosts and their capabilities, flavors, instances,
//! quota limits and (optionally) control-plane settings. Building a fleet
//! wires the in-memory collaborators and starts one agent per host.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use vmtune_api::{AuthorizationService, PolicyAuthorizer, ReconfigurationApi};
use vmtune_compute::{
    AgentBus, ComputeServices, HostProfile, InMemoryInstanceRepository, InMemoryQuota,
    InstanceLocks, QuotaLimits, ReconfigurationService,
};
use vmtune_conductor::Conductor;
use vmtune_core::{
    ControlPlaneConfig, Flavor, HostRef, Instance, PowerState, ProjectId, ResourceDelta, TaskState,
};

/// Parsed fleet file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Fleet {
    #[serde(default)]
    pub(crate) control: ControlPlaneConfig,
    #[serde(default)]
    quota: QuotaSpec,
    #[serde(default)]
    hosts: Vec<HostSpec>,
    #[serde(default)]
    flavors: Vec<FlavorSpec>,
    #[serde(default)]
    instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuotaSpec {
    vcpus: Option<i64>,
    memory_mb: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct HostSpec {
    name: String,
    #[serde(flatten)]
    profile: HostProfile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlavorSpec {
    id: String,
    vcpus: u32,
    memory_mb: u64,
    #[serde(default)]
    root_gb: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstanceSpec {
    id: String,
    #[serde(default = "default_project")]
    project: String,
    flavor: String,
    host: Option<String>,
    #[serde(default = "default_power_state")]
    power_state: PowerState,
    task_state: Option<TaskState>,
}

fn default_project() -> String {
    "p1".to_string()
}

fn default_power_state() -> PowerState {
    PowerState::Running
}

/// Wired control plane over a fleet
pub(crate) struct Plane {
    pub(crate) repo: Arc<InMemoryInstanceRepository>,
    pub(crate) api: ReconfigurationApi,
    pub(crate) conductor: Conductor,
    pub(crate) authz: Arc<dyn AuthorizationService>,
    flavors: BTreeMap<String, Flavor>,
}

impl Plane {
    /// Flavor by id
    pub(crate) fn flavor(&self, id: &str) -> Result<Flavor> {
        self.flavors
            .get(id)
            .cloned()
            .with_context(|| format!("unknown flavor {id}"))
    }
}

impl Fleet {
    /// Parse from TOML text and check cross references
    pub(crate) fn from_toml_str(text: &str) -> Result<Self> {
        let fleet: Self = toml::from_str(text).context("failed to parse fleet")?;
        fleet.validate()?;
        Ok(fleet)
    }

    /// Load from a TOML file
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        self.control.validate().context("invalid [control] section")?;

        let flavors: Vec<&str> = self.flavors.iter().map(|f| f.id.as_str()).collect();
        let hosts: Vec<&str> = self.hosts.iter().map(|h| h.name.as_str()).collect();
        for instance in &self.instances {
            if !flavors.contains(&instance.flavor.as_str()) {
                bail!("instance {} uses unknown flavor {}", instance.id, instance.flavor);
            }
            if let Some(host) = instance.host.as_deref().filter(|h| !hosts.contains(h)) {
                bail!("instance {} is placed on unknown host {host}", instance.id);
            }
        }
        Ok(())
    }

    /// Start host agents and wire every collaborator
    ///
    /// Must run inside a tokio runtime.
    pub(crate) fn build(self) -> Result<Plane> {
        let flavors: BTreeMap<String, Flavor> = self
            .flavors
            .into_iter()
            .map(|entry| {
                let flavor = Flavor::new(entry.id.as_str(), entry.vcpus, entry.memory_mb)
                    .with_root_gb(entry.root_gb);
                (entry.id, flavor)
            })
            .collect();

        let limits = QuotaLimits::new(
            self.quota.vcpus.unwrap_or(i64::MAX),
            self.quota.memory_mb.unwrap_or(i64::MAX),
        );
        let quota = Arc::new(InMemoryQuota::new(limits));
        let repo = Arc::new(InMemoryInstanceRepository::new());

        for entry in self.instances {
            let flavor = flavors
                .get(&entry.flavor)
                .cloned()
                .with_context(|| format!("unknown flavor {}", entry.flavor))?;
            let project = ProjectId::from(entry.project);
            let memory_mb = i64::try_from(flavor.memory_mb).unwrap_or(i64::MAX);
            quota.add_usage(
                project.clone(),
                ResourceDelta::new(i64::from(flavor.vcpus), memory_mb),
            );

            let mut instance =
                Instance::new(entry.id, project, flavor).with_power_state(entry.power_state);
            instance.host = entry.host.map(HostRef::from);
            instance.task_state = entry.task_state;
            repo.insert(instance);
        }

        let bus = AgentBus::new(repo.clone(), self.control.agent_queue_depth);
        let hosts = self.hosts.len();
        for host in self.hosts {
            bus.register_host(host.name, host.profile);
        }
        tracing::info!(hosts, instances = repo.len(), flavors = flavors.len(), "fleet ready");

        let services = ComputeServices::new(
            repo.clone(),
            quota,
            Arc::new(bus),
            Arc::new(InstanceLocks::new(self.control.lock_wait())),
        );
        let authz: Arc<dyn AuthorizationService> =
            Arc::new(PolicyAuthorizer::new(self.control.policy.clone()));
        let api = ReconfigurationApi::new(
            ReconfigurationService::new(services.clone()),
            Arc::clone(&authz),
            &self.control.limits,
        )?;

        Ok(Plane {
            repo,
            api,
            conductor: Conductor::new(services),
            authz,
            flavors,
        })
    }
}
