//! Provider capability interface.
//!
//! The engine never talks to a real API. Everything it knows about a
//! resource type comes from a [`Provider`]: its schema, and the CRUD
//! operations that turn a planned object into a real one.

pub mod builtin;
mod registry;
pub mod schema;

pub use registry::ProviderRegistry;
pub use schema::{
    AttributeSchema, BlockSchema, NestedBlockSchema, Nesting, ProviderSchema, ResourceSchema,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::ResourceAddress;
use crate::error::ProviderError;
use crate::value::Attributes;

/// Object returned by a provider after an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    /// Resolved attributes.
    pub attributes: Attributes,
    /// Opaque provider data stored with the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
}

impl ObjectState {
    /// Creates an object with no private data.
    #[must_use]
    pub const fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            private: None,
        }
    }
}

/// Input of a create, update or delete call.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Instance being changed.
    pub address: ResourceAddress,
    /// Current object, absent for create.
    pub prior: Option<ObjectState>,
    /// Desired attributes with all references resolved. Empty for delete.
    pub planned: Attributes,
}

/// A failed operation, possibly with an object that was partly created.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// What went wrong.
    pub error: ProviderError,
    /// Object that exists remotely despite the failure.
    pub partial: Option<ObjectState>,
}

impl ProviderFailure {
    /// Failure with no partial object.
    #[must_use]
    pub const fn new(error: ProviderError) -> Self {
        Self {
            error,
            partial: None,
        }
    }

    /// Failure that left a partial object behind.
    #[must_use]
    pub const fn with_partial(error: ProviderError, partial: ObjectState) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }
}

impl From<ProviderError> for ProviderFailure {
    fn from(error: ProviderError) -> Self {
        Self::new(error)
    }
}

/// Result of a create or update call.
pub type OperationResult = Result<ObjectState, ProviderFailure>;

/// CRUD capability for the resource types of one provider.
///
/// Implementations must be safe to call concurrently unless their schema
/// sets `serialize_operations`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Schemas of every resource and data source type.
    fn schema(&self) -> ProviderSchema;

    /// Creates a new object.
    async fn create(&self, request: OperationRequest) -> OperationResult;

    /// Updates an existing object in place.
    async fn update(&self, request: OperationRequest) -> OperationResult;

    /// Deletes an object. An object that is already gone should be
    /// reported as [`ProviderError::NotFound`].
    async fn delete(&self, request: OperationRequest) -> Result<(), ProviderFailure>;

    /// Reads the real object. `Ok(None)` means it no longer exists.
    async fn read(
        &self,
        address: ResourceAddress,
        current: ObjectState,
    ) -> Result<Option<ObjectState>, ProviderError>;

    /// Evaluates a data source.
    async fn read_data(
        &self,
        address: ResourceAddress,
        config: Attributes,
    ) -> Result<ObjectState, ProviderError>;

    /// Reads an existing object by its remote id so it can be adopted.
    async fn import_state(
        &self,
        resource_type: String,
        id: String,
    ) -> Result<ObjectState, ProviderError>;

    /// Asks in-flight operations to stop as soon as possible.
    fn stop(&self);
}
