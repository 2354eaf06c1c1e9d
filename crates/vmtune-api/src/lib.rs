//! vmtune API - endpoints for live vCPU and memory reconfiguration
//!
//! - Read and action handler capabilities
//! - Authorization and schema middleware
//! - Boundary translation of domain failures
//!
//! # Example
//!
//! ```rust,ignore
//! use vmtune_api::prelude::*;
//!
//! let api = ReconfigurationApi::new(service, Arc::new(PolicyAuthorizer::default()), &limits)?;
//! let response = api
//!     .endpoint(ResourceKind::Vcpus)
//!     .action(&ctx, &"A".into(), &json!({"setVcpus": {"vcpus": 4}}))
//!     .await;
//! assert_eq!(response.code(), 202);
//! ```

#![warn(unreachable_pub)]

pub mod auth;
pub mod endpoint;
pub mod response;
pub mod schema;
pub mod translator;

pub use auth::{AuthorizationService, PolicyAuthorizer};
pub use endpoint::{
    ActionHandler, Authorize, ReadHandler, ReconfigurationApi, ReconfigurationEndpoint,
    ResourceChanger, ResourceReader, ValidateBody,
};
pub use response::{ApiResponse, ApiStatus};
pub use schema::ActionSchema;
pub use translator::ErrorTranslator;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with vmtune API
    pub use crate::{
        ApiResponse, ApiStatus, AuthorizationService, ErrorTranslator, PolicyAuthorizer,
        ReconfigurationApi, ReconfigurationEndpoint,
    };
    pub use vmtune_core::{RequestContext, ResourceKind};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
