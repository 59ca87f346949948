//! Resource addresses.
//!
//! An address identifies exactly one resource instance, for example
//! `module.net["eu"].local_file.config[0]` or `data.local_file.seed`.
//! Addresses are the node key in the dependency graph and the key of the
//! persisted state map.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Key of one instance created by `count` or `for_each`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    /// Index produced by `count`.
    Int(u64),
    /// Key produced by `for_each`.
    Str(String),
}

/// One module call on the path to a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleStep {
    /// Module call name.
    pub name: String,
    /// Instance key when the module call is expanded.
    pub key: Option<InstanceKey>,
}

/// Whether the address names a managed resource or a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ResourceMode {
    /// A resource whose lifecycle is managed.
    #[default]
    Managed,
    /// A data source that is only read.
    Data,
}

/// Unique path to one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    module: Vec<ModuleStep>,
    mode: ResourceMode,
    resource_type: String,
    name: String,
    key: Option<InstanceKey>,
}

impl ResourceAddress {
    /// Creates a managed resource address in the root module.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: Vec::new(),
            mode: ResourceMode::Managed,
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    /// Creates a data source address in the root module.
    #[must_use]
    pub fn data(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            ..Self::new(resource_type, name)
        }
    }

    /// Returns the address with the given instance key.
    #[must_use]
    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns the address placed under the given module path.
    #[must_use]
    pub fn in_module(mut self, module: Vec<ModuleStep>) -> Self {
        self.module = module;
        self
    }

    /// Module path.
    #[must_use]
    pub fn module(&self) -> &[ModuleStep] {
        &self.module
    }

    /// Resource mode.
    #[must_use]
    pub const fn mode(&self) -> ResourceMode {
        self.mode
    }

    /// Resource type, e.g. `local_file`.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Resource name from configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance key, if any.
    #[must_use]
    pub const fn key(&self) -> Option<&InstanceKey> {
        self.key.as_ref()
    }

    /// Returns true for data source addresses.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.mode == ResourceMode::Data
    }

    /// Provider name implied by the resource type (`local_file` -> `local`).
    #[must_use]
    pub fn implied_provider(&self) -> &str {
        self.resource_type
            .split_once('_')
            .map_or(self.resource_type.as_str(), |(prefix, _)| prefix)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "[{i}]"),
            Self::Str(s) => write!(f, "[{s:?}]"),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.module {
            write!(f, "module.{}", step.name)?;
            if let Some(key) = &step.key {
                write!(f, "{key}")?;
            }
            write!(f, ".")?;
        }
        if self.mode == ResourceMode::Data {
            write!(f, "data.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// Splits `name[key]` into the name and an optional parsed key.
fn split_key(segment: &str) -> Result<(&str, Option<InstanceKey>), String> {
    let Some(open) = segment.find('[') else {
        return Ok((segment, None));
    };
    let inner = segment[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| format!("unterminated instance key in \"{segment}\""))?;
    let key = if let Some(s) = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        InstanceKey::Str(s.to_string())
    } else {
        InstanceKey::Int(
            inner
                .parse()
                .map_err(|_| format!("invalid instance key \"{inner}\""))?,
        )
    };
    Ok((&segment[..open], Some(key)))
}

/// Splits an address string on dots that are not inside brackets.
fn split_segments(s: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => depth += 1,
            ']' if !in_quotes => depth = depth.saturating_sub(1),
            '.' if depth == 0 && !in_quotes => {
                segments.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&s[start..]);
    segments
}

impl FromStr for ResourceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = split_segments(s.trim());
        let mut idx = 0;
        let mut module = Vec::new();

        while segments.get(idx) == Some(&"module") {
            let call = segments
                .get(idx + 1)
                .ok_or_else(|| format!("missing module name in address \"{s}\""))?;
            let (name, key) = split_key(call)?;
            module.push(ModuleStep {
                name: name.to_string(),
                key,
            });
            idx += 2;
        }

        let mode = if segments.get(idx) == Some(&"data") {
            idx += 1;
            ResourceMode::Data
        } else {
            ResourceMode::Managed
        };

        let (Some(resource_type), Some(last), None) =
            (segments.get(idx), segments.get(idx + 1), segments.get(idx + 2))
        else {
            return Err(format!("invalid resource address \"{s}\": expected TYPE.NAME"));
        };

        let (name, key) = split_key(last)?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(format!("invalid resource address \"{s}\": empty type or name"));
        }

        Ok(Self {
            module,
            mode,
            resource_type: (*resource_type).to_string(),
            name: name.to_string(),
            key,
        })
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_address_display() {
        let addr = ResourceAddress::new("local_file", "motd").with_key(InstanceKey::Int(1));
        assert_eq!(addr.to_string(), "local_file.motd[1]");
        assert_eq!(addr.implied_provider(), "local");
    }

    #[test]
    fn test_parse_module_address() {
        let addr: ResourceAddress = "module.net[\"eu.west\"].module.dns.null_resource.r[\"a\"]"
            .parse()
            .unwrap();
        assert_eq!(addr.module().len(), 2);
        assert_eq!(addr.module()[0].key, Some(InstanceKey::Str("eu.west".to_string())));
        assert_eq!(addr.resource_type(), "null_resource");
        assert_eq!(addr.key(), Some(&InstanceKey::Str("a".to_string())));
        assert_eq!(
            addr.to_string(),
            "module.net[\"eu.west\"].module.dns.null_resource.r[\"a\"]"
        );
    }

    #[test]
    fn test_parse_data_address() {
        let addr: ResourceAddress = "data.local_file.seed".parse().unwrap();
        assert!(addr.is_data());
        assert_eq!(addr.to_string(), "data.local_file.seed");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("local_file".parse::<ResourceAddress>().is_err());
        assert!("a.b.c".parse::<ResourceAddress>().is_err());
        assert!("a.b[x]".parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_serde_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ResourceAddress::new("null_resource", "a"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "{\"null_resource.a\":1}");
        let back: std::collections::BTreeMap<ResourceAddress, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
