//! Lifecycle state guard
//!
//! The only gate between a validated request and a remote dispatch.
//! Every operation has an allowed power-state set; an instance with an
//! in-flight task state is refused regardless of power state.

use std::collections::HashMap;
use vmtune_core::{ComputeError, Instance, Operation, PowerState};

/// Allowed power states per operation
#[derive(Debug, Clone)]
pub struct StateGuard {
    allowed: HashMap<Operation, Vec<PowerState>>,
}

impl StateGuard {
    /// Create guard with the default table
    #[must_use]
    pub fn new() -> Self {
        use PowerState::{Paused, Running, Shutdown};

        let mut allowed = HashMap::new();
        allowed.insert(Operation::SetVcpus, vec![Running, Paused]);
        allowed.insert(Operation::SetMem, vec![Running, Paused]);
        allowed.insert(Operation::LiveResize, vec![Running, Paused]);
        allowed.insert(Operation::Resize, vec![Running, Paused, Shutdown]);
        allowed.insert(Operation::Migrate, vec![Running, Paused, Shutdown]);
        Self { allowed }
    }

    /// Override the allowed set for one operation
    #[must_use]
    pub fn with_rule(mut self, operation: Operation, states: impl Into<Vec<PowerState>>) -> Self {
        self.allowed.insert(operation, states.into());
        self
    }

    /// Allowed power states for an operation
    #[must_use]
    pub fn allowed_states(&self, operation: Operation) -> &[PowerState] {
        self.allowed.get(&operation).map_or(&[], Vec::as_slice)
    }

    /// Check that `instance` may undergo `operation`
    ///
    /// # Errors
    /// `InvalidState` naming the offending attribute, its value and the operation
    pub fn check(&self, instance: &Instance, operation: Operation) -> Result<(), ComputeError> {
        if !self.allowed_states(operation).contains(&instance.power_state) {
            tracing::info!(
                instance = %instance.id,
                power_state = %instance.power_state,
                %operation,
                "refusing operation in current power state"
            );
            return Err(ComputeError::invalid_power_state(
                instance.id.clone(),
                instance.power_state,
                operation,
            ));
        }

        if let Some(task_state) = instance.task_state {
            tracing::info!(
                instance = %instance.id,
                %task_state,
                %operation,
                "refusing operation while another task is in flight"
            );
            return Err(ComputeError::InvalidState {
                id: instance.id.clone(),
                attr: "task_state",
                state: task_state.to_string(),
                method: operation,
            });
        }

        Ok(())
    }
}

impl Default for StateGuard {
    fn default() -> Self {
        Self::new()
    }
}
