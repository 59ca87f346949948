//! Provider registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::builtin::{LocalProvider, NullProvider};
use super::{Provider, ProviderSchema, ResourceSchema};
use crate::address::ResourceAddress;
use crate::error::ConfigError;

struct Entry {
    provider: Arc<dyn Provider>,
    schema: ProviderSchema,
}

/// Providers available to one engine, keyed by provider name.
///
/// Schemas are fetched once at registration.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, Arc<Entry>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `local` and `null` providers.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("local", Arc::new(LocalProvider::new()));
        registry.register("null", Arc::new(NullProvider::new()));
        registry
    }

    /// Registers a provider, replacing any previous one with that name.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let schema = provider.schema();
        self.entries
            .insert(name.into(), Arc::new(Entry { provider, schema }));
    }

    /// Looks up a provider.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entries.get(name).map(|e| Arc::clone(&e.provider))
    }

    /// Looks up a provider schema.
    #[must_use]
    pub fn schema(&self, name: &str) -> Option<&ProviderSchema> {
        self.entries.get(name).map(|e| &e.schema)
    }

    /// Returns true if the provider's operations must not overlap.
    #[must_use]
    pub fn is_serialized(&self, name: &str) -> bool {
        self.schema(name).is_some_and(|s| s.serialize_operations)
    }

    /// Looks up the schema for the type an address names.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is not registered or does not
    /// offer the resource type.
    pub fn resource_schema(
        &self,
        provider: &str,
        address: &ResourceAddress,
    ) -> Result<&ResourceSchema, ConfigError> {
        let schema = self
            .schema(provider)
            .ok_or_else(|| ConfigError::UnknownProvider {
                provider: provider.to_string(),
                address: address.clone(),
            })?;
        let (table, kind) = if address.is_data() {
            (&schema.data_sources, "data source")
        } else {
            (&schema.resources, "resource")
        };
        table
            .get(address.resource_type())
            .ok_or_else(|| ConfigError::UnknownResourceType {
                provider: provider.to_string(),
                kind,
                resource_type: address.resource_type().to_string(),
            })
    }

    /// Names of the registered providers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Sends a stop request to every provider.
    pub fn stop_all(&self) {
        for entry in self.entries.values() {
            entry.provider.stop();
        }
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["local", "null"]);

        let addr = ResourceAddress::new("local_file", "a");
        assert!(registry.resource_schema("local", &addr).is_ok());

        let data = ResourceAddress::data("local_file", "a");
        assert!(registry.resource_schema("local", &data).is_ok());
    }

    #[test]
    fn test_unknown_provider_and_type() {
        let registry = ProviderRegistry::with_builtin();
        let addr = ResourceAddress::new("aws_instance", "a");
        assert!(matches!(
            registry.resource_schema("aws", &addr),
            Err(ConfigError::UnknownProvider { .. })
        ));

        let addr = ResourceAddress::new("null_thing", "a");
        assert!(matches!(
            registry.resource_schema("null", &addr),
            Err(ConfigError::UnknownResourceType { .. })
        ));
    }
}
