//! Action body schemas
//!
//! `{ "setVcpus": { "vcpus": N } }` and `{ "setMem": { "mem": N } }`, with
//! no additional properties and N bounded by the configured limits.

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use vmtune_core::{ComputeError, ConfigError, ResourceKind, ResourceLimits};

/// Compiled schema for one action
pub struct ActionSchema {
    kind: ResourceKind,
    minimum: u64,
    maximum: u64,
    compiled: JSONSchema,
}

impl ActionSchema {
    /// Compile the schema of `kind` under `limits`
    ///
    /// # Errors
    /// `Invalid` if the generated document does not compile
    pub fn new(kind: ResourceKind, limits: &ResourceLimits) -> Result<Self, ConfigError> {
        let (minimum, maximum) = bounds(kind, limits);
        let document = Self::document(kind, limits);
        let compiled = JSONSchema::compile(&document)
            .map_err(|e| ConfigError::Invalid(format!("{} schema: {e}", kind.action())))?;

        Ok(Self {
            kind,
            minimum,
            maximum,
            compiled,
        })
    }

    /// JSON schema document for `kind` under `limits`
    #[must_use]
    pub fn document(kind: ResourceKind, limits: &ResourceLimits) -> Value {
        let (minimum, maximum) = bounds(kind, limits);
        json!({
            "type": "object",
            "properties": {
                kind.action(): {
                    "type": "object",
                    "properties": {
                        kind.field(): {
                            "type": "integer",
                            "minimum": minimum,
                            "maximum": maximum,
                        }
                    },
                    "required": [kind.field()],
                    "additionalProperties": false,
                }
            },
            "required": [kind.action()],
            "additionalProperties": false,
        })
    }

    /// Resource this schema validates
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Inclusive bounds on the requested value
    #[inline]
    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        (self.minimum, self.maximum)
    }

    /// Validate `body` and extract the requested value
    ///
    /// # Errors
    /// `Validation` naming the first offending value
    pub fn validate(&self, body: &Value) -> Result<u64, ComputeError> {
        if let Err(mut errors) = self.compiled.validate(body) {
            let message = errors.next().map_or_else(
                || "request body does not match schema".to_string(),
                |e| format!("Invalid input for field/attribute. Value: {}. {e}", e.instance),
            );
            return Err(ComputeError::Validation(message));
        }

        body.get(self.kind.action())
            .and_then(|action| action.get(self.kind.field()))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ComputeError::Validation(format!("{} must be an integer", self.kind.field()))
            })
    }
}

impl std::fmt::Debug for ActionSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSchema")
            .field("kind", &self.kind)
            .field("minimum", &self.minimum)
            .field("maximum", &self.maximum)
            .finish_non_exhaustive()
    }
}

fn bounds(kind: ResourceKind, limits: &ResourceLimits) -> (u64, u64) {
    match kind {
        ResourceKind::Vcpus => (1, limits.max_vcpus),
        ResourceKind::Memory => (limits.min_memory_mb, limits.max_memory_mb),
    }
}
