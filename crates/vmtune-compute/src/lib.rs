//! vmtune Compute - the guarded dispatch path to compute hosts
//!
//! - Instance lookup with not-found / unknown-location surfacing
//! - Lifecycle state guard
//! - Per-instance single-flight locking
//! - Quota reservations with exactly-once release
//! - Asynchronous command dispatch to host agents
//!
//! # Example
//!
//! ```rust,ignore
//! use vmtune_compute::prelude::*;
//!
//! let service = ReconfigurationService::new(services);
//! service
//!     .reconfigure(&"A".into(), ReconfigurationRequest::new(ResourceKind::Vcpus, 4))
//!     .await?;
//! service.quiesce(&"A".into()).await;
//! ```

#![warn(unreachable_pub)]

pub mod agent;
pub mod dispatcher;
pub mod guard;
pub mod locks;
pub mod lookup;
pub mod quota;
pub mod repository;
pub mod service;

pub use agent::{
    AgentAck, AgentBus, AgentChannel, AgentCommand, Completion, CompletionHandle, HostProfile,
};
pub use dispatcher::{DispatchReceipt, ReconfigurationDispatcher};
pub use guard::StateGuard;
pub use locks::{InstanceLease, InstanceLocks};
pub use lookup::ResourceLookupGate;
pub use quota::{
    InMemoryQuota, ProjectUsage, QuotaLimits, QuotaReservationService, QuotaStats, Reservation,
};
pub use repository::{InMemoryInstanceRepository, InstanceRepository, InstanceUpdate};
pub use service::{release_reservation, Accepted, ComputeServices, ReconfigurationService};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with vmtune Compute
    pub use crate::{
        AgentBus, ComputeServices, HostProfile, InMemoryInstanceRepository, InMemoryQuota,
        InstanceLocks, ReconfigurationService, StateGuard,
    };
    pub use vmtune_core::{ReconfigurationRequest, ResourceKind};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
