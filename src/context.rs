//! Explicit engine context.
//!
//! Everything the planner, walker and executor need besides the plan
//! itself: providers, tuning and the retry policy. There is no global
//! registry; a context is built once per run and passed down.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::address::ResourceAddress;
use crate::config::{DeployConfig, SettingsConfig};
use crate::engine::RetryPolicy;
use crate::error::ConfigError;
use crate::provider::{Provider, ProviderRegistry};

/// Providers and settings shared by one run.
#[derive(Debug, Clone)]
pub struct EngineContext {
    registry: ProviderRegistry,
    settings: SettingsConfig,
    retry: RetryPolicy,
    serialized: BTreeSet<String>,
}

impl EngineContext {
    /// Creates a context for a configuration.
    #[must_use]
    pub fn new(registry: ProviderRegistry, config: &DeployConfig) -> Self {
        let serialized = registry
            .names()
            .filter(|name| registry.is_serialized(name))
            .map(str::to_string)
            .chain(
                config
                    .providers
                    .iter()
                    .filter(|(_, p)| p.serialize)
                    .map(|(name, _)| name.clone()),
            )
            .collect();

        Self {
            retry: RetryPolicy::from_settings(&config.settings),
            settings: config.settings.clone(),
            registry,
            serialized,
        }
    }

    /// Context with default settings and no configured providers.
    #[must_use]
    pub fn with_registry(registry: ProviderRegistry) -> Self {
        Self::new(registry, &DeployConfig::empty("default"))
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registered providers.
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Engine settings.
    #[must_use]
    pub const fn settings(&self) -> &SettingsConfig {
        &self.settings
    }

    /// Retry policy for provider calls.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Providers whose operations must not overlap.
    #[must_use]
    pub const fn serialized_providers(&self) -> &BTreeSet<String> {
        &self.serialized
    }

    /// Maximum number of nodes applied at once.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.settings.parallelism.max(1)
    }

    /// Looks up the provider managing an address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProvider`] if it is not registered.
    pub fn provider(&self, name: &str, address: &ResourceAddress) -> Result<Arc<dyn Provider>, ConfigError> {
        self.registry.get(name).ok_or_else(|| ConfigError::UnknownProvider {
            provider: name.to_string(),
            address: address.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_serialized_providers_from_config() {
        let mut config = DeployConfig::empty("demo");
        config
            .providers
            .insert("null".to_string(), ProviderConfig { serialize: true });
        let ctx = EngineContext::new(ProviderRegistry::with_builtin(), &config);
        assert!(ctx.serialized_providers().contains("null"));
        assert!(!ctx.serialized_providers().contains("local"));
    }

    #[test]
    fn test_parallelism_never_zero() {
        let mut config = DeployConfig::empty("demo");
        config.settings.parallelism = 0;
        let ctx = EngineContext::new(ProviderRegistry::new(), &config);
        assert_eq!(ctx.parallelism(), 1);
    }
}
