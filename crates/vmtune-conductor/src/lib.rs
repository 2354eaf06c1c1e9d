//! vmtune Conductor - deferred multi-step operations
//!
//! - Task contract with mandatory rollback
//! - Live resize, cold resize and migration tasks
//! - Safe execution that rolls a failed task back
//!
//! # Example
//!
//! ```rust,ignore
//! use vmtune_conductor::prelude::*;
//!
//! let conductor = Conductor::new(services);
//! let reservation = conductor.reserve_for_flavor(&id, &flavor).await?;
//! let summary = conductor
//!     .live_resize(ctx, None, id, flavor, Some(reservation))
//!     .await?;
//! assert_eq!(summary.phase, TaskPhase::Completed);
//! ```

#![warn(unreachable_pub)]

pub mod conductor;
pub mod error;
pub mod migrate;
pub mod resize;
pub mod task;

pub use conductor::Conductor;
pub use error::TaskError;
pub use migrate::MigrateTask;
pub use resize::{LiveResizeTask, ResizeTask};
pub use task::{Task, TaskKind, TaskPhase, TaskSummary};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with vmtune Conductor
    pub use crate::{Conductor, Task, TaskError, TaskKind, TaskPhase, TaskSummary};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
