//! Core types for vmtune
//!
//! Defines the fundamental types shared by the control plane:
//! - Instance, flavor and image references
//! - Power and task states
//! - Reconfiguration requests and resource deltas
//! - Request context and identifiers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from anything string-like
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Instance identifier (opaque, usually a UUID string)
    InstanceId
);
string_id!(
    /// Compute host an instance is bound to
    HostRef
);
string_id!(
    /// Flavor identifier
    FlavorId
);
string_id!(
    /// Source image reference
    ImageRef
);
string_id!(
    /// Owning project (tenant)
    ProjectId
);

/// Unique reservation identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub Ulid);

impl ReservationId {
    /// Generate new reservation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Generate new task ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hypervisor-reported power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// No state reported yet
    NoState,
    /// Guest is running
    Running,
    /// Guest is paused in memory
    Paused,
    /// Guest is shut off
    Shutdown,
    /// Guest crashed
    Crashed,
    /// Guest suspended to disk
    Suspended,
}

impl PowerState {
    /// Every power state, in declaration order
    pub const ALL: [PowerState; 6] = [
        PowerState::NoState,
        PowerState::Running,
        PowerState::Paused,
        PowerState::Shutdown,
        PowerState::Crashed,
        PowerState::Suspended,
    ];

    /// Wire/log name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::NoState => "no_state",
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Shutdown => "shutdown",
            PowerState::Crashed => "crashed",
            PowerState::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight operation marker on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Still being built
    Building,
    /// Live or cold migration in progress
    Migrating,
    /// Cold resize being prepared
    ResizePrep,
    /// Cold resize moving the guest
    ResizeMigrating,
    /// Live resize in progress
    LiveResizing,
    /// vCPU or memory hot change in progress
    Hotplugging,
    /// Being deleted
    Deleting,
}

impl TaskState {
    /// Wire/log name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Building => "building",
            TaskState::Migrating => "migrating",
            TaskState::ResizePrep => "resize_prep",
            TaskState::ResizeMigrating => "resize_migrating",
            TaskState::LiveResizing => "live_resizing",
            TaskState::Hotplugging => "hotplugging",
            TaskState::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sizing descriptor used as the target shape of a resize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Flavor id
    pub id: FlavorId,
    /// Display name
    pub name: String,
    /// Virtual CPU count
    pub vcpus: u32,
    /// Memory in MiB
    pub memory_mb: u64,
    /// Root disk in GiB
    #[serde(default)]
    pub root_gb: u64,
    /// Free-form extra specs
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    /// Create new flavor
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<FlavorId>, vcpus: u32, memory_mb: u64) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            vcpus,
            memory_mb,
            root_gb: 0,
            extra_specs: BTreeMap::new(),
        }
    }

    /// With root disk size
    #[inline]
    #[must_use]
    pub fn with_root_gb(mut self, root_gb: u64) -> Self {
        self.root_gb = root_gb;
        self
    }
}

/// Instance record as held by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance id
    pub id: InstanceId,
    /// Owning project
    pub project_id: ProjectId,
    /// Current vCPU count
    pub vcpus: u32,
    /// Current memory in MiB
    pub memory_mb: u64,
    /// Power state
    pub power_state: PowerState,
    /// In-flight operation, if any
    #[serde(default)]
    pub task_state: Option<TaskState>,
    /// Hosting compute node; `None` when the location is unresolvable
    #[serde(default)]
    pub host: Option<HostRef>,
    /// Bound flavor
    pub flavor: Flavor,
}

impl Instance {
    /// Create a running instance sized by `flavor`, with no host yet
    #[must_use]
    pub fn new(id: impl Into<InstanceId>, project_id: impl Into<ProjectId>, flavor: Flavor) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            vcpus: flavor.vcpus,
            memory_mb: flavor.memory_mb,
            power_state: PowerState::Running,
            task_state: None,
            host: None,
            flavor,
        }
    }

    /// With hosting compute node
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<HostRef>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// With power state
    #[inline]
    #[must_use]
    pub fn with_power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    /// With in-flight task state
    #[inline]
    #[must_use]
    pub fn with_task_state(mut self, state: TaskState) -> Self {
        self.task_state = Some(state);
        self
    }

    /// Current value of a hot-tunable resource
    #[inline]
    #[must_use]
    pub fn value_of(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Vcpus => u64::from(self.vcpus),
            ResourceKind::Memory => self.memory_mb,
        }
    }

    /// Apply a flavor binding, resizing vcpus and memory to match
    pub fn bind_flavor(&mut self, flavor: Flavor) {
        self.vcpus = flavor.vcpus;
        self.memory_mb = flavor.memory_mb;
        self.flavor = flavor;
    }
}

/// Hot-tunable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual CPUs (hotplug)
    Vcpus,
    /// Memory in MiB (hottune)
    Memory,
}

impl ResourceKind {
    /// Action name in request bodies
    #[inline]
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            ResourceKind::Vcpus => "setVcpus",
            ResourceKind::Memory => "setMem",
        }
    }

    /// Value field inside the action body and the read response
    #[inline]
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            ResourceKind::Vcpus => "vcpus",
            ResourceKind::Memory => "mem",
        }
    }

    /// Policy alias guarding both endpoints of this kind
    #[inline]
    #[must_use]
    pub fn alias(&self) -> &'static str {
        self.operation().policy_alias()
    }

    /// Operation checked by the state guard
    #[inline]
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            ResourceKind::Vcpus => Operation::SetVcpus,
            ResourceKind::Memory => Operation::SetMem,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field())
    }
}

/// Operations gated by lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// vCPU hotplug
    SetVcpus,
    /// Memory hottune
    SetMem,
    /// Flavor change while running
    LiveResize,
    /// Cold resize
    Resize,
    /// Move to another host
    Migrate,
}

impl Operation {
    /// Every operation, in declaration order
    pub const ALL: [Operation; 5] = [
        Operation::SetVcpus,
        Operation::SetMem,
        Operation::LiveResize,
        Operation::Resize,
        Operation::Migrate,
    ];

    /// Name used in conflict messages
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SetVcpus => "setVcpus",
            Operation::SetMem => "setMem",
            Operation::LiveResize => "live resize",
            Operation::Resize => "resize",
            Operation::Migrate => "migrate",
        }
    }

    /// Policy alias a caller must pass to request the operation
    #[inline]
    #[must_use]
    pub fn policy_alias(&self) -> &'static str {
        match self {
            Operation::SetVcpus => "os-server-cpu-hotplug",
            Operation::SetMem => "os-server-mem-hottune",
            Operation::LiveResize => "os-server-live-resize",
            Operation::Resize => "os-server-resize",
            Operation::Migrate => "os-migrate-server",
        }
    }

    /// Task state recorded while the operation is in flight
    #[inline]
    #[must_use]
    pub fn in_flight_state(&self) -> TaskState {
        match self {
            Operation::SetVcpus | Operation::SetMem => TaskState::Hotplugging,
            Operation::LiveResize => TaskState::LiveResizing,
            Operation::Resize => TaskState::ResizeMigrating,
            Operation::Migrate => TaskState::Migrating,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested change of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationRequest {
    /// Resource being changed
    pub kind: ResourceKind,
    /// Requested new value (vCPU count or MiB)
    pub value: u64,
}

impl ReconfigurationRequest {
    /// Create new request
    #[inline]
    #[must_use]
    pub fn new(kind: ResourceKind, value: u64) -> Self {
        Self { kind, value }
    }

    /// Quota delta this request implies for `instance`
    #[must_use]
    pub fn delta_for(&self, instance: &Instance) -> ResourceDelta {
        let diff = signed_diff(self.value, instance.value_of(self.kind));
        match self.kind {
            ResourceKind::Vcpus => ResourceDelta::new(diff, 0),
            ResourceKind::Memory => ResourceDelta::new(0, diff),
        }
    }
}

/// Signed change in quota-tracked resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDelta {
    /// vCPU change
    pub vcpus: i64,
    /// Memory change in MiB
    pub memory_mb: i64,
}

impl ResourceDelta {
    /// Create new delta
    #[inline]
    #[must_use]
    pub fn new(vcpus: i64, memory_mb: i64) -> Self {
        Self { vcpus, memory_mb }
    }

    /// Delta moving from one flavor to another
    #[must_use]
    pub fn between(from: &Flavor, to: &Flavor) -> Self {
        Self {
            vcpus: signed_diff(u64::from(to.vcpus), u64::from(from.vcpus)),
            memory_mb: signed_diff(to.memory_mb, from.memory_mb),
        }
    }

    /// Delta moving a live instance onto `to`
    ///
    /// Measured from the instance's current vCPUs and memory, which differ
    /// from its bound flavor after a hotplug or hottune.
    #[must_use]
    pub fn resizing(instance: &Instance, to: &Flavor) -> Self {
        Self {
            vcpus: signed_diff(u64::from(to.vcpus), u64::from(instance.vcpus)),
            memory_mb: signed_diff(to.memory_mb, instance.memory_mb),
        }
    }

    /// Whether the delta changes nothing
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vcpus == 0 && self.memory_mb == 0
    }

    /// Positive part only; shrinking never needs a hold
    #[inline]
    #[must_use]
    pub fn growth(&self) -> Self {
        Self {
            vcpus: self.vcpus.max(0),
            memory_mb: self.memory_mb.max(0),
        }
    }
}

fn signed_diff(new: u64, old: u64) -> i64 {
    let new = i64::try_from(new).unwrap_or(i64::MAX);
    let old = i64::try_from(old).unwrap_or(i64::MAX);
    new.saturating_sub(old)
}

/// Per-request caller context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Request id for log correlation
    pub request_id: Uuid,
    /// Calling user
    pub user_id: String,
    /// Calling project
    pub project_id: ProjectId,
    /// Granted roles
    pub roles: Vec<String>,
}

impl RequestContext {
    /// Create new context with no roles
    #[must_use]
    pub fn new(user_id: impl Into<String>, project_id: impl Into<ProjectId>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            roles: Vec::new(),
        }
    }

    /// Internal context used by the conductor and agents
    #[must_use]
    pub fn admin() -> Self {
        Self::new("vmtune", "service").with_roles(["admin"])
    }

    /// With roles
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Check for a role
    #[inline]
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Flavor {
        Flavor::new("m1.small", 1, 2048)
    }

    #[test]
    fn instance_takes_shape_from_flavor() {
        let instance = Instance::new("A", "p1", small()).with_host("node-1");
        assert_eq!(instance.vcpus, 1);
        assert_eq!(instance.memory_mb, 2048);
        assert_eq!(instance.power_state, PowerState::Running);
        assert_eq!(instance.host, Some(HostRef::from("node-1")));
        assert_eq!(instance.value_of(ResourceKind::Memory), 2048);
    }

    #[test]
    fn bind_flavor_resizes() {
        let mut instance = Instance::new("A", "p1", small());
        instance.bind_flavor(Flavor::new("m1.large", 4, 8192));
        assert_eq!(instance.vcpus, 4);
        assert_eq!(instance.memory_mb, 8192);
        assert_eq!(instance.flavor.id.as_str(), "m1.large");
    }

    #[test]
    fn request_delta_is_signed() {
        let instance = Instance::new("A", "p1", small());
        let grow = ReconfigurationRequest::new(ResourceKind::Vcpus, 3).delta_for(&instance);
        assert_eq!(grow, ResourceDelta::new(2, 0));

        let shrink = ReconfigurationRequest::new(ResourceKind::Memory, 1024).delta_for(&instance);
        assert_eq!(shrink, ResourceDelta::new(0, -1024));
        assert!(shrink.growth().is_empty());
    }

    #[test]
    fn flavor_delta() {
        let delta = ResourceDelta::between(&small(), &Flavor::new("m1.medium", 2, 4096));
        assert_eq!(delta, ResourceDelta::new(1, 2048));
    }

    #[test]
    fn resizing_delta_starts_from_live_shape() {
        let mut instance = Instance::new("A", "p1", small());
        instance.vcpus = 4;
        let delta = ResourceDelta::resizing(&instance, &Flavor::new("m1.large", 4, 8192));
        assert_eq!(delta, ResourceDelta::new(0, 6144));
    }

    #[test]
    fn kind_names() {
        assert_eq!(ResourceKind::Vcpus.action(), "setVcpus");
        assert_eq!(ResourceKind::Memory.field(), "mem");
        assert_eq!(ResourceKind::Memory.operation(), Operation::SetMem);
        assert_eq!(Operation::LiveResize.to_string(), "live resize");
        assert_eq!(ResourceKind::Vcpus.alias(), Operation::SetVcpus.policy_alias());
        assert_eq!(Operation::Migrate.policy_alias(), "os-migrate-server");
    }

    #[test]
    fn power_state_serde_names() {
        let json = serde_json::to_string(&PowerState::Shutdown).unwrap();
        assert_eq!(json, "\"shutdown\"");
    }

    #[test]
    fn context_roles() {
        let ctx = RequestContext::new("alice", "p1").with_roles(["member"]);
        assert!(ctx.has_role("member"));
        assert!(!ctx.has_role("admin"));
        assert!(RequestContext::admin().has_role("admin"));
    }

    proptest::proptest! {
        #[test]
        fn delta_between_flavors_is_antisymmetric(
            a_cpu in 1u32..256,
            b_cpu in 1u32..256,
            a_mem in 128u64..1_048_576,
            b_mem in 128u64..1_048_576,
        ) {
            let a = Flavor::new("a", a_cpu, a_mem);
            let b = Flavor::new("b", b_cpu, b_mem);
            let forward = ResourceDelta::between(&a, &b);
            let back = ResourceDelta::between(&b, &a);

            proptest::prop_assert_eq!(forward.vcpus, -back.vcpus);
            proptest::prop_assert_eq!(forward.memory_mb, -back.memory_mb);
            proptest::prop_assert!(forward.growth().vcpus >= 0 && forward.growth().memory_mb >= 0);
            proptest::prop_assert_eq!(forward.is_empty(), a_cpu == b_cpu && a_mem == b_mem);
        }
    }
}
