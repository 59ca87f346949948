//! State types for tracking managed resource instances.
//!
//! These types represent the recorded state of every instance the engine
//! manages. A snapshot is read at the start of a run, copied into working
//! state, and written back once the run finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::address::ResourceAddress;
use crate::provider::ObjectState;
use crate::value::{AttrPath, Attributes};

/// Current version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: u32,
    /// Incremented on every write that changes content.
    pub serial: u64,
    /// Identity of this state's history, fixed at creation.
    pub lineage: String,
    /// Recorded instances keyed by address.
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddress, ResourceInstanceState>,
    /// Recent runs that changed the state.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
}

/// State of a single resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceState {
    /// Provider that manages the instance.
    pub provider: String,
    /// Schema version the attributes were written with.
    #[serde(default)]
    pub schema_version: u64,
    /// Recorded attribute values.
    pub attributes: Attributes,
    /// Paths whose values must never be displayed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub sensitive_paths: BTreeSet<AttrPath>,
    /// Opaque provider data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    /// Whether the instance is known to be complete.
    #[serde(default)]
    pub status: InstanceStatus,
    /// Addresses this instance depended on when last applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ResourceAddress>,
    /// When the instance was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the instance was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Instance status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// The last operation on the instance succeeded.
    #[default]
    Ready,
    /// The instance exists but is incomplete; it will be replaced.
    Tainted,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Configuration hash at the time of the run.
    pub config_hash: String,
    /// Addresses changed by the run.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan and apply.
    Apply,
    /// Destroy everything.
    Destroy,
    /// Refresh from providers.
    Refresh,
    /// Import an existing object.
    Import,
    /// Manual removal from state.
    StateRm,
}

impl StateSnapshot {
    /// Creates an empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            resources: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Returns true if both snapshots record the same data, ignoring the
    /// serial and write time.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.version == other.version
            && self.lineage == other.lineage
            && self.resources == other.resources
            && self.history == other.history
    }

    /// Gets an instance by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceInstanceState> {
        self.resources.get(address)
    }

    /// Adds or replaces an instance.
    pub fn insert(&mut self, address: ResourceAddress, instance: ResourceInstanceState) {
        self.resources.insert(address, instance);
    }

    /// Removes an instance.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceInstanceState> {
        self.resources.remove(address)
    }

    /// Recorded managed instance addresses. Data sources are read again on
    /// every plan and never deleted, so they are excluded.
    pub fn managed_addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.resources.keys().filter(|a| !a.is_data())
    }

    /// Adds a history entry, dropping the oldest past [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceInstanceState {
    /// Creates a ready instance from a provider result.
    #[must_use]
    pub fn new(provider: impl Into<String>, schema_version: u64, object: ObjectState) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.into(),
            schema_version,
            attributes: object.attributes,
            sensitive_paths: BTreeSet::new(),
            private: object.private,
            status: InstanceStatus::Ready,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The attributes and private data as a provider object.
    #[must_use]
    pub fn object(&self) -> ObjectState {
        ObjectState {
            attributes: self.attributes.clone(),
            private: self.private.clone(),
        }
    }

    /// Replaces the recorded object, keeping the creation time.
    pub fn set_object(&mut self, object: ObjectState) {
        if self.attributes != object.attributes || self.private != object.private {
            self.attributes = object.attributes;
            self.private = object.private;
            self.updated_at = Utc::now();
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: InstanceStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// Returns true if the instance must be replaced.
    #[must_use]
    pub fn is_tainted(&self) -> bool {
        self.status == InstanceStatus::Tainted
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Ready => "ready",
            Self::Tainted => "tainted",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::Import => "import",
            Self::StateRm => "state rm",
        };
        write!(f, "{op}")
    }
}
