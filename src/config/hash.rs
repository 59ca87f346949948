//! Configuration hashing for change detection.
//!
//! The hash covers what decides the desired state: declared resources,
//! data sources and modules. Tuning knobs such as parallelism do not
//! change it. Runs record the hash in the state history.

use sha2::{Digest, Sha256};

use super::spec::{DeployConfig, ForEach, ModuleConfig, ResourceConfig};
use crate::value::Value;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the declared infrastructure.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        for resource in &config.resources {
            hasher.update(b"resource");
            hasher.update(self.hash_resource(resource).as_bytes());
        }
        for data in &config.data {
            hasher.update(b"data");
            hasher.update(self.hash_resource(data).as_bytes());
        }
        for module in &config.modules {
            hasher.update(self.hash_module(module).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource block.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update(resource.name.as_bytes());
        hasher.update(resource.provider_name().as_bytes());
        if let Some(count) = resource.count {
            hasher.update(count.to_be_bytes());
        }
        hash_for_each(&mut hasher, resource.for_each.as_ref());

        for dep in &resource.depends_on {
            hasher.update(dep.as_bytes());
        }
        hasher.update([u8::from(resource.lifecycle.prevent_destroy)]);
        for path in &resource.lifecycle.ignore_changes {
            hasher.update(path.as_bytes());
        }

        // BTreeMap iteration keeps attribute order stable
        for (name, value) in &resource.attributes {
            hasher.update(name.as_bytes());
            hasher.update(Value::from_yaml(value).to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    fn hash_module(&self, module: &ModuleConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(b"module");
        hasher.update(module.name.as_bytes());
        if let Some(count) = module.count {
            hasher.update(count.to_be_bytes());
        }
        hash_for_each(&mut hasher, module.for_each.as_ref());
        for resource in &module.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }
        for data in &module.data {
            hasher.update(b"data");
            hasher.update(self.hash_resource(data).as_bytes());
        }
        for nested in &module.modules {
            hasher.update(self.hash_module(nested).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display.
    #[must_use]
    pub fn short_hash(&self, config: &DeployConfig) -> String {
        self.hash_config(config)[..8].to_string()
    }
}

fn hash_for_each(hasher: &mut Sha256, for_each: Option<&ForEach>) {
    match for_each {
        Some(ForEach::List(items)) => {
            let mut sorted: Vec<&String> = items.iter().collect();
            sorted.sort();
            sorted.dedup();
            for item in sorted {
                hasher.update(item.as_bytes());
            }
        }
        Some(ForEach::Map(entries)) => {
            for (key, value) in entries {
                hasher.update(key.as_bytes());
                hasher.update(Value::from_yaml(value).to_string().as_bytes());
            }
        }
        None => {}
    }
}
