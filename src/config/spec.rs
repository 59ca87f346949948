//! Configuration specification types.
//!
//! This module defines the structs that map to `converge.yaml`. The file
//! declares the desired resources; everything else (settings, state,
//! guardrails) tunes how the engine converges them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Engine tuning.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Optional guardrails configuration.
    #[serde(default)]
    pub guardrails: Option<GuardrailsConfig>,
    /// Per-provider settings.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Managed resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Data sources.
    #[serde(default)]
    pub data: Vec<ResourceConfig>,
    /// Inline module calls.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettingsConfig {
    /// Maximum number of nodes applied at once.
    pub parallelism: usize,
    /// Time budget of a single provider call.
    pub operation_timeout_secs: u64,
    /// How long to wait for a lock held by someone else.
    pub lock_timeout_secs: u64,
    /// Plan/apply rounds allowed when providers ask for replacement.
    pub max_replan_attempts: u32,
    /// Time given to in-flight operations after a hard cancel.
    pub hard_cancel_grace_secs: u64,
    /// Retry policy for retryable provider errors.
    pub retry: RetryConfig,
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay.
    pub max_backoff_ms: u64,
    /// Delay growth factor.
    pub multiplier: f64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
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
    /// Local state file path (for local backend).
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

/// Guardrails checked against every plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GuardrailsConfig {
    /// Maximum number of instances a plan may delete or replace.
    #[serde(default)]
    pub max_destroy: Option<usize>,
}

/// Settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    /// Run this provider's operations one at a time.
    #[serde(default)]
    pub serialize: bool,
}

/// A resource or data source block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type, e.g. `local_file`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name, unique per type within a module.
    pub name: String,
    /// Provider name; implied by the type prefix when absent.
    #[serde(default)]
    pub provider: Option<String>,
    /// Number of instances.
    #[serde(default)]
    pub count: Option<u64>,
    /// One instance per element or key.
    #[serde(default)]
    pub for_each: Option<ForEach>,
    /// Explicit ordering, as `TYPE.NAME` or `data.TYPE.NAME`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle rules.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Attribute values; strings may contain `${...}` expressions.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

/// Collection driving `for_each`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ForEach {
    /// A set of strings; each key equals its value.
    List(Vec<String>),
    /// A map from key to value.
    Map(BTreeMap<String, serde_yaml::Value>),
}

/// Lifecycle rules of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Refuse plans that delete or replace the resource.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attributes whose configured changes are ignored.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

/// An inline module call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Module call name.
    pub name: String,
    /// Number of module instances.
    #[serde(default)]
    pub count: Option<u64>,
    /// One module instance per element or key.
    #[serde(default)]
    pub for_each: Option<ForEach>,
    /// Managed resources in the module.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Data sources in the module.
    #[serde(default)]
    pub data: Vec<ResourceConfig>,
    /// Nested module calls.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            operation_timeout_secs: 300,
            lock_timeout_secs: 0,
            max_replan_attempts: 3,
            hard_cancel_grace_secs: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl DeployConfig {
    /// Creates a configuration with no resources.
    #[must_use]
    pub fn empty(project: &str) -> Self {
        Self {
            project: ProjectConfig {
                name: project.to_string(),
                environment: default_environment(),
            },
            settings: SettingsConfig::default(),
            state: StateConfig::default(),
            guardrails: None,
            providers: BTreeMap::new(),
            resources: Vec::new(),
            data: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Same project and settings, with every resource removed.
    #[must_use]
    pub fn without_resources(&self) -> Self {
        Self {
            resources: Vec::new(),
            data: Vec::new(),
            modules: Vec::new(),
            ..self.clone()
        }
    }

    /// Maximum destroy count from guardrails.
    #[must_use]
    pub fn max_destroy(&self) -> Option<usize> {
        self.guardrails.as_ref().and_then(|g| g.max_destroy)
    }

    /// Whether the provider is configured to run serially.
    #[must_use]
    pub fn provider_serialized(&self, provider: &str) -> bool {
        self.providers.get(provider).is_some_and(|p| p.serialize)
    }
}

impl ResourceConfig {
    /// Provider name, explicit or implied by the type prefix.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or_else(|| {
            self.resource_type
                .split_once('_')
                .map_or(self.resource_type.as_str(), |(prefix, _)| prefix)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let config: DeployConfig = serde_yaml::from_str("project:\n  name: demo\n").unwrap();
        assert_eq!(config.settings.parallelism, 10);
        assert_eq!(config.settings.retry.max_attempts, 5);
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.project.environment, "dev");
    }

    #[test]
    fn test_for_each_forms() {
        let list: ForEach = serde_yaml::from_str("[a, b]").unwrap();
        assert!(matches!(list, ForEach::List(ref v) if v.len() == 2));
        let map: ForEach = serde_yaml::from_str("{a: 1, b: two}").unwrap();
        assert!(matches!(map, ForEach::Map(ref m) if m.len() == 2));
    }

    #[test]
    fn test_provider_name() {
        let yaml = "type: local_file\nname: x\n";
        let mut resource: ResourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.provider_name(), "local");
        resource.provider = Some("other".to_string());
        assert_eq!(resource.provider_name(), "other");
    }
}
