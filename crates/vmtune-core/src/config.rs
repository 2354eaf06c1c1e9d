//! Control-plane configuration
//!
//! Loaded from TOML; every field has a default so partial files work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML did not parse
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parsed but are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level control-plane configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Policy bounds on requested values
    pub limits: ResourceLimits,
    /// How long a request waits for another reconfiguration of the same instance
    pub lock_wait_ms: u64,
    /// Command queue depth per host agent
    pub agent_queue_depth: usize,
    /// Authorization rules
    pub policy: PolicyConfig,
}

impl ControlPlaneConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With resource limits
    #[inline]
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// With lock wait
    #[inline]
    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With policy rules
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Lock wait as a duration
    #[inline]
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_vcpus == 0 {
            return Err(ConfigError::Invalid("limits.max_vcpus must be at least 1".into()));
        }
        if self.limits.min_memory_mb == 0 || self.limits.min_memory_mb > self.limits.max_memory_mb {
            return Err(ConfigError::Invalid(format!(
                "limits.min_memory_mb ({}) must be in 1..={}",
                self.limits.min_memory_mb, self.limits.max_memory_mb
            )));
        }
        if self.agent_queue_depth == 0 {
            return Err(ConfigError::Invalid("agent_queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            lock_wait_ms: 5_000,
            agent_queue_depth: 64,
            policy: PolicyConfig::default(),
        }
    }
}

/// Upper and lower bounds accepted by the action schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum vCPUs per instance
    pub max_vcpus: u64,
    /// Minimum memory in MiB
    pub min_memory_mb: u64,
    /// Maximum memory in MiB
    pub max_memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_vcpus: 64,
            min_memory_mb: 128,
            max_memory_mb: 512 * 1024,
        }
    }
}

/// Alias → roles table; an empty role list admits any caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Required roles per policy alias
    pub rules: BTreeMap<String, Vec<String>>,
    /// Roles for aliases missing from `rules`
    pub default_roles: Vec<String>,
}

impl PolicyConfig {
    /// Roles required for `alias`
    #[must_use]
    pub fn roles_for(&self, alias: &str) -> &[String] {
        self.rules.get(alias).map_or(&self.default_roles, Vec::as_slice)
    }

    /// With a rule
    #[must_use]
    pub fn with_rule<I, S>(mut self, alias: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .insert(alias.into(), roles.into_iter().map(Into::into).collect());
        self
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let admin_or_member = vec!["admin".to_string(), "member".to_string()];
        let mut rules = BTreeMap::new();
        rules.insert("os-server-cpu-hotplug".to_string(), admin_or_member.clone());
        rules.insert("os-server-mem-hottune".to_string(), admin_or_member);
        Self {
            rules,
            default_roles: vec!["admin".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(ControlPlaneConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ControlPlaneConfig::from_toml_str(
            r#"
            lock_wait_ms = 250

            [limits]
            max_vcpus = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.lock_wait(), Duration::from_millis(250));
        assert_eq!(config.limits.max_vcpus, 16);
        assert_eq!(config.limits.max_memory_mb, ResourceLimits::default().max_memory_mb);
        assert_eq!(config.policy, PolicyConfig::default());
    }

    #[test]
    fn rejects_inverted_memory_bounds() {
        let result = ControlPlaneConfig::from_toml_str(
            r"
            [limits]
            min_memory_mb = 4096
            max_memory_mb = 1024
            ",
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [policy]
            default_roles = []

            [policy.rules]
            "os-server-cpu-hotplug" = ["operator"]
            "#
        )
        .unwrap();

        let config = ControlPlaneConfig::load(file.path()).unwrap();
        assert_eq!(config.policy.roles_for("os-server-cpu-hotplug"), ["operator".to_string()]);
        assert!(config.policy.roles_for("anything-else").is_empty());
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let result = ControlPlaneConfig::from_toml_str("limits = 3");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
