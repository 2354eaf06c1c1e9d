//! vmtune Core - shared vocabulary of the reconfiguration control plane
//!
//! - Instances, flavors, power and task states
//! - Reconfiguration requests and quota deltas
//! - The domain error taxonomy translated at the API boundary
//! - Control-plane configuration

#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, ControlPlaneConfig, PolicyConfig, ResourceLimits};
pub use error::ComputeError;
pub use types::{
    Flavor, FlavorId, HostRef, ImageRef, Instance, InstanceId, Operation, PowerState, ProjectId,
    ReconfigurationRequest, RequestContext, ReservationId, ResourceDelta, ResourceKind, TaskId,
    TaskState,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with vmtune Core
    pub use crate::{
        ComputeError, ControlPlaneConfig, Flavor, Instance, InstanceId, Operation, PowerState,
        RequestContext, ResourceKind,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
