//! Plan file configuration types.
//!
//! This module defines the structs that map to the `tierform.yaml` file.
//! Resource attributes stay as raw YAML here; they are turned into typed
//! [`AttributeValue`](super::value::AttributeValue) trees when the plan is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The root structure of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Resource declarations, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Output declarations (name to value).
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_yaml::Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Target region, forwarded to the provider.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Control-plane gateway endpoint (required for http).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-memory simulated provider.
    #[default]
    Simulated,
    /// JSON control-plane gateway over HTTP.
    Http,
}

/// Apply engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of resources in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Readiness polling settings.
    #[serde(default)]
    pub poll: PollConfig,
}

/// Readiness polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    /// First delay between describe calls, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the delay between describe calls, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction applied to each delay (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Overrides every per-kind readiness bound when set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A single resource declaration as written in the plan file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique identifier within the plan.
    pub id: String,
    /// Resource type tag (e.g., `vpc`, `load_balancer`).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Number of instances to create; expands into `id[0]` .. `id[N-1]`.
    #[serde(default)]
    pub count: Option<usize>,
    /// Explicit dependencies, in addition to the references in attributes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Raw attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    10
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter() -> f64 {
    0.2
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            timeout_secs: None,
        }
    }
}

impl PlanConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the declared resource identifiers, before count expansion.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }

    /// Returns the number of resource instances after count expansion.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.resources.iter().map(|r| r.count.unwrap_or(1)).sum()
    }
}

impl PollConfig {
    /// Initial delay as a [`Duration`].
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: PlanConfig = serde_yaml::from_str("project:\n  name: web-stack\n").unwrap();
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Simulated);
        assert_eq!(config.engine.parallelism, 10);
        assert_eq!(config.engine.poll.initial_delay(), Duration::from_millis(500));
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_resource_type_and_count() {
        let yaml = r"
project:
  name: web-stack
resources:
  - id: subnet
    type: subnet
    count: 3
    attributes:
      vpc_id: ${vpc.id}
      cidr_block: 10.0.${count.index}.0/24
  - id: vpc
    type: vpc
";
        let config: PlanConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.resources[0].type_name, "subnet");
        assert_eq!(config.resources[0].count, Some(3));
        assert_eq!(config.instance_count(), 4);
        assert_eq!(config.resource_ids(), vec!["subnet", "vpc"]);
        assert_eq!(config.qualified_name(), "web-stack-dev");
    }
}
