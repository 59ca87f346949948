//! Error types for the converge engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, state persistence, provider calls, planning, graph
//! construction and apply.

use std::path::PathBuf;
use thiserror::Error;

use crate::address::ResourceAddress;
use crate::provider::ObjectState;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource instance.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// An expression references something that does not exist.
    #[error("{address}: unresolvable reference to {reference}")]
    UnresolvableReference {
        /// Resource containing the expression.
        address: ResourceAddress,
        /// The reference as written.
        reference: String,
    },

    /// An expression could not be parsed.
    #[error("{address}: invalid expression \"{expression}\": {message}")]
    InvalidExpression {
        /// Resource containing the expression.
        address: String,
        /// The expression text.
        expression: String,
        /// What went wrong.
        message: String,
    },

    /// Configuration does not match the provider schema.
    #[error("{address}: schema mismatch at {attribute}: {message}")]
    SchemaMismatch {
        /// Resource being checked.
        address: ResourceAddress,
        /// Attribute path.
        attribute: String,
        /// Description of the mismatch.
        message: String,
    },

    /// No provider is registered for a resource.
    #[error("No provider \"{provider}\" registered for {address}")]
    UnknownProvider {
        /// Provider name.
        provider: String,
        /// Resource requiring it.
        address: ResourceAddress,
    },

    /// Provider does not know the resource type.
    #[error("Provider \"{provider}\" has no {kind} type \"{resource_type}\"")]
    UnknownResourceType {
        /// Provider name.
        provider: String,
        /// "resource" or "data source".
        kind: &'static str,
        /// The unknown type.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error(
        "State is locked by {holder} for {operation} (lock {lock_id}, since {since}, held for {age_secs}s)"
    )]
    LockedByOther {
        /// Lock identifier, needed for a manual force-unlock.
        lock_id: String,
        /// Identifier of the lock holder.
        holder: String,
        /// Operation the holder is running.
        operation: String,
        /// When the lock was acquired.
        since: String,
        /// Age of the lock in seconds.
        age_secs: i64,
    },

    /// The lock being released is not the one currently held.
    #[error("Lock ID mismatch: expected {expected}, found {found}")]
    LockMismatch {
        /// Lock ID the caller presented.
        expected: String,
        /// Lock ID currently recorded.
        found: String,
    },

    /// Backend I/O error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },

    /// Another writer changed the state since it was read.
    #[error("State serial conflict: read at serial {expected}, persisted serial is {found}")]
    SerialConflict {
        /// Serial the writer read.
        expected: u64,
        /// Serial found in the backend.
        found: u64,
    },

    /// The persisted state belongs to a different lineage.
    #[error("State lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch {
        /// Lineage of the snapshot being written.
        expected: String,
        /// Lineage found in the backend.
        found: String,
    },

    /// Address not present in state.
    #[error("No instance recorded at {address}")]
    InstanceNotFound {
        /// The missing address.
        address: ResourceAddress,
    },

    /// Import target is already recorded.
    #[error("{address} is already managed; remove it from state before importing")]
    AlreadyManaged {
        /// The recorded address.
        address: ResourceAddress,
    },
}

/// Errors returned by provider operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Transient failure; the call may succeed if repeated.
    #[error("{message} (retryable)")]
    Retryable {
        /// Provider message.
        message: String,
    },

    /// Permanent failure.
    #[error("{message}")]
    Fatal {
        /// Provider message.
        message: String,
    },

    /// The provider decided mid-operation that an in-place update is not
    /// possible.
    #[error("update requires replacement (attributes: {})", .attributes.join(", "))]
    RequiresReplace {
        /// Attributes that force replacement.
        attributes: Vec<String>,
    },

    /// The remote object does not exist.
    #[error("remote object not found")]
    NotFound,

    /// The operation exceeded its time budget.
    #[error("operation timed out after {secs}s")]
    Timeout {
        /// Budget in seconds.
        secs: u64,
    },

    /// The operation was aborted by a stop request.
    #[error("operation cancelled")]
    Cancelled,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Plan would destroy more instances than allowed.
    #[error("Plan would destroy {planned} instances, limit is {limit}")]
    DestroyLimitExceeded {
        /// Number of instances the plan deletes or replaces.
        planned: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Plan would destroy an instance marked `prevent_destroy`.
    #[error("{address} has prevent_destroy set but the plan would {action} it")]
    PreventDestroy {
        /// Protected address.
        address: ResourceAddress,
        /// Planned action.
        action: String,
    },

    /// A data source could not be read while planning.
    #[error("{address}: reading data source failed: {message}")]
    ReadFailed {
        /// Data source address.
        address: ResourceAddress,
        /// Description of the failure.
        message: String,
    },

    /// Replanning did not converge.
    #[error("Replanning gave up after {attempts} attempts")]
    ReplanExhausted {
        /// Number of plan/apply rounds performed.
        attempts: u32,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph contains a cycle.
    #[error("Cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// Addresses on the cycle, first address repeated at the end.
        cycle: Vec<ResourceAddress>,
    },

    /// An edge names a node that is not in the graph.
    #[error("{from} depends on {to}, which is not part of the graph")]
    MissingNode {
        /// Dependent address.
        from: ResourceAddress,
        /// Missing dependency.
        to: ResourceAddress,
    },
}

/// Errors raised while applying a single node.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The provider operation failed.
    #[error("{address}: {operation} failed: {source}")]
    OperationFailed {
        /// Node address.
        address: ResourceAddress,
        /// Operation name.
        operation: &'static str,
        /// Provider error.
        #[source]
        source: ProviderError,
        /// Partial state the provider reported, if any.
        partial: Option<Box<ObjectState>>,
    },

    /// Retries were exhausted for a retryable error.
    #[error("{address}: {operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Node address.
        address: ResourceAddress,
        /// Operation name.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        last: ProviderError,
        /// Partial state reported by the last attempt, if any.
        partial: Option<Box<ObjectState>>,
    },

    /// The provider left attributes unknown after apply.
    #[error("{address}: provider left {} unknown after apply", .attributes.join(", "))]
    UnknownAfterApply {
        /// Node address.
        address: ResourceAddress,
        /// Attributes still unknown.
        attributes: Vec<String>,
    },

    /// The provider asked for a replacement instead of an update.
    #[error("{address}: provider requires replacement, re-planning")]
    ReplanRequired {
        /// Node address.
        address: ResourceAddress,
    },

    /// A reference could not be evaluated at apply time.
    #[error("{address}: {message}")]
    Evaluation {
        /// Node address.
        address: ResourceAddress,
        /// Description of the problem.
        message: String,
    },

    /// The node was skipped because a dependency failed.
    #[error("{address}: skipped because {dependency} failed")]
    DependencyFailed {
        /// Skipped address.
        address: ResourceAddress,
        /// First failed dependency.
        dependency: ResourceAddress,
    },

    /// The node was not run because the walk was cancelled.
    #[error("{address}: cancelled before completion")]
    Cancelled {
        /// Node address.
        address: ResourceAddress,
    },

    /// The task applying the node panicked.
    #[error("{address}: apply task panicked: {message}")]
    Panicked {
        /// Node address.
        address: ResourceAddress,
        /// Panic description.
        message: String,
    },
}

fn format_cycle(cycle: &[ResourceAddress]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Retryable { .. })
                | Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the provider classified this error as transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

impl ApplyError {
    /// Address of the node this error belongs to.
    #[must_use]
    pub const fn address(&self) -> &ResourceAddress {
        match self {
            Self::OperationFailed { address, .. }
            | Self::RetriesExhausted { address, .. }
            | Self::UnknownAfterApply { address, .. }
            | Self::ReplanRequired { address }
            | Self::Evaluation { address, .. }
            | Self::DependencyFailed { address, .. }
            | Self::Cancelled { address }
            | Self::Panicked { address, .. } => address,
        }
    }

    /// Partial object a failed provider call left behind.
    #[must_use]
    pub fn partial(&self) -> Option<&ObjectState> {
        match self {
            Self::OperationFailed { partial, .. } | Self::RetriesExhausted { partial, .. } => {
                partial.as_deref()
            }
            _ => None,
        }
    }

    /// Returns true if the error asks for a new plan rather than failing.
    #[must_use]
    pub const fn is_replan_signal(&self) -> bool {
        matches!(self, Self::ReplanRequired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_address() {
        let a = ResourceAddress::new("null_resource", "a");
        let b = ResourceAddress::new("null_resource", "b");
        let err = GraphError::CycleDetected {
            cycle: vec![a.clone(), b, a],
        };
        assert_eq!(
            err.to_string(),
            "Cycle detected: null_resource.a -> null_resource.b -> null_resource.a"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::retryable("throttled").is_retryable());
        assert!(!ProviderError::fatal("bad request").is_retryable());
        assert!(!ProviderError::NotFound.is_retryable());
        assert!(ConvergeError::from(ProviderError::retryable("x")).is_retryable());
    }
}
