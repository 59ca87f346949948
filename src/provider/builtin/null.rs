//! The `null` provider: resources with no remote side effects.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::address::ResourceAddress;
use crate::error::ProviderError;
use crate::provider::{
    AttributeSchema, BlockSchema, ObjectState, OperationRequest, OperationResult, Provider,
    ProviderFailure, ProviderSchema, ResourceSchema,
};
use crate::value::{Attributes, Value, ValueType};

/// Provides `null_resource` and the `null_data_source` data source.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

impl NullProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for NullProvider {
    fn schema(&self) -> ProviderSchema {
        let string_map = || ValueType::Map(Box::new(ValueType::String));
        ProviderSchema::new()
            .with_resource(
                "null_resource",
                ResourceSchema::new(
                    BlockSchema::new()
                        .with_attribute("triggers", AttributeSchema::optional(string_map()).force_new())
                        .with_attribute("id", AttributeSchema::computed(ValueType::String)),
                ),
            )
            .with_data_source(
                "null_data_source",
                ResourceSchema::new(
                    BlockSchema::new()
                        .with_attribute("inputs", AttributeSchema::optional(string_map()))
                        .with_attribute("outputs", AttributeSchema::computed(string_map()))
                        .with_attribute("id", AttributeSchema::computed(ValueType::String)),
                ),
            )
    }

    async fn create(&self, request: OperationRequest) -> OperationResult {
        let mut attributes = request.planned;
        attributes.insert(
            "id".to_string(),
            Value::String(uuid::Uuid::new_v4().simple().to_string()),
        );
        Ok(ObjectState::new(attributes))
    }

    async fn update(&self, request: OperationRequest) -> OperationResult {
        let mut attributes = request.planned;
        let id = request
            .prior
            .and_then(|p| p.attributes.get("id").cloned())
            .unwrap_or(Value::Null);
        attributes.insert("id".to_string(), id);
        Ok(ObjectState::new(attributes))
    }

    async fn delete(&self, _request: OperationRequest) -> Result<(), ProviderFailure> {
        Ok(())
    }

    async fn read(
        &self,
        _address: ResourceAddress,
        current: ObjectState,
    ) -> Result<Option<ObjectState>, ProviderError> {
        Ok(Some(current))
    }

    async fn read_data(
        &self,
        _address: ResourceAddress,
        config: Attributes,
    ) -> Result<ObjectState, ProviderError> {
        let inputs = match config.get("inputs") {
            Some(Value::Map(m)) => m.clone(),
            _ => BTreeMap::new(),
        };
        let mut attributes = config;
        attributes.insert("outputs".to_string(), Value::Map(inputs));
        attributes.insert("id".to_string(), Value::string("static"));
        Ok(ObjectState::new(attributes))
    }

    async fn import_state(
        &self,
        resource_type: String,
        id: String,
    ) -> Result<ObjectState, ProviderError> {
        if resource_type != "null_resource" {
            return Err(ProviderError::fatal(format!("cannot import {resource_type}")));
        }
        let mut attributes = Attributes::new();
        attributes.insert("id".to_string(), Value::String(id));
        attributes.insert("triggers".to_string(), Value::Null);
        Ok(ObjectState::new(attributes))
    }

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_assigns_id_and_update_keeps_it() {
        let provider = NullProvider::new();
        let mut planned = Attributes::new();
        planned.insert("triggers".to_string(), Value::Null);
        let created = provider
            .create(OperationRequest {
                address: ResourceAddress::new("null_resource", "a"),
                prior: None,
                planned: planned.clone(),
            })
            .await
            .unwrap();
        let id = created.attributes.get("id").cloned().unwrap();
        assert!(id.as_str().is_some_and(|s| s.len() == 32));

        let updated = provider
            .update(OperationRequest {
                address: ResourceAddress::new("null_resource", "a"),
                prior: Some(created),
                planned,
            })
            .await
            .unwrap();
        assert_eq!(updated.attributes.get("id"), Some(&id));
    }

    #[tokio::test]
    async fn test_data_source_copies_inputs() {
        let provider = NullProvider::new();
        let mut inputs = BTreeMap::new();
        inputs.insert("k".to_string(), Value::string("v"));
        let mut config = Attributes::new();
        config.insert("inputs".to_string(), Value::Map(inputs.clone()));
        let data = provider
            .read_data(ResourceAddress::data("null_data_source", "d"), config)
            .await
            .unwrap();
        assert_eq!(data.attributes.get("outputs"), Some(&Value::Map(inputs)));
    }
}
