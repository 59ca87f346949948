//! Apply executor.
//!
//! Runs the provider operation for one graph node and merges the result
//! into working state. References are evaluated again here, against the
//! values dependencies produced during this walk.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ResourceAddress;
use crate::config::{ResolvedConfig, ResolvedResource};
use crate::context::EngineContext;
use crate::error::{ApplyError, ProviderError};
use crate::planner::{Action, Change, DiffEngine, DiffRequest, ReplaceReason};
use crate::provider::{ObjectState, OperationRequest, Provider, ProviderFailure, ResourceSchema};
use crate::state::{InstanceStatus, ResourceInstanceState, WorkingState};
use crate::value::{AttrPath, Attributes, Value};

/// Applies single changes against providers.
#[derive(Debug, Clone)]
pub struct ApplyExecutor {
    ctx: Arc<EngineContext>,
    config: Arc<ResolvedConfig>,
    state: WorkingState,
    cancel: CancellationToken,
}

fn unknown_paths(attributes: &Attributes) -> Vec<String> {
    attributes
        .iter()
        .filter(|(_, v)| v.contains_unknown())
        .map(|(k, _)| k.clone())
        .collect()
}

fn evaluation_error(address: &ResourceAddress, message: impl ToString) -> ApplyError {
    ApplyError::Evaluation {
        address: address.clone(),
        message: message.to_string(),
    }
}

impl ApplyExecutor {
    /// Creates an executor. `cancel` interrupts retry backoff.
    #[must_use]
    pub const fn new(
        ctx: Arc<EngineContext>,
        config: Arc<ResolvedConfig>,
        state: WorkingState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            config,
            state,
            cancel,
        }
    }

    /// Working state the executor writes to.
    #[must_use]
    pub const fn state(&self) -> &WorkingState {
        &self.state
    }

    /// Applies one change.
    ///
    /// # Errors
    ///
    /// Returns the node's error. Any partial object the provider reported
    /// has already been recorded as tainted when this returns.
    pub async fn apply(&self, change: &Change) -> Result<(), ApplyError> {
        let address = &change.address;
        debug!(address = %address, action = %change.action, "Applying change");

        match change.action {
            Action::NoOp => Ok(()),
            Action::Read => self.read(change).await,
            Action::Delete => {
                let prior = self.state.get(address).await;
                match prior {
                    Some(prior) => self.delete(change, &prior).await,
                    None => Ok(()),
                }
            }
            Action::Create | Action::Update | Action::Replace => self.converge(change).await,
        }
    }

    /// Destroys the prior object of a replaced instance, leaving the
    /// create half to [`apply`](Self::apply).
    ///
    /// # Errors
    ///
    /// Returns the provider's delete error.
    pub async fn destroy(&self, change: &Change) -> Result<(), ApplyError> {
        debug!(address = %change.address, "Destroying replaced object");
        match self.state.get(&change.address).await {
            Some(prior) => self.delete(change, &prior).await,
            None => Ok(()),
        }
    }

    fn provider(&self, change: &Change) -> Result<Arc<dyn Provider>, ApplyError> {
        self.ctx
            .provider(&change.provider, &change.address)
            .map_err(|e| evaluation_error(&change.address, e))
    }

    fn resource(&self, address: &ResourceAddress) -> Result<&ResolvedResource, ApplyError> {
        self.config
            .get(address)
            .ok_or_else(|| evaluation_error(address, "instance is not part of the configuration"))
    }

    fn schema(&self, change: &Change) -> Result<&ResourceSchema, ApplyError> {
        self.ctx
            .registry()
            .resource_schema(&change.provider, &change.address)
            .map_err(|e| evaluation_error(&change.address, e))
    }

    /// Evaluates configuration against values already in working state.
    async fn evaluate(&self, resource: &ResolvedResource) -> Result<Attributes, ApplyError> {
        let lookup: BTreeMap<ResourceAddress, Value> = self
            .state
            .with_read(|snapshot| {
                resource
                    .references
                    .iter()
                    .filter_map(|a| snapshot.get(a).map(|i| (a.clone(), Value::Object(i.attributes.clone()))))
                    .collect()
            })
            .await;
        let desired = resource
            .evaluate(&lookup)
            .map_err(|e| evaluation_error(&resource.address, e))?;
        let unknown = unknown_paths(&desired);
        if !unknown.is_empty() {
            return Err(evaluation_error(
                &resource.address,
                format!("{} still unknown after dependencies were applied", unknown.join(", ")),
            ));
        }
        Ok(desired)
    }

    async fn record(&self, change: &Change, object: ObjectState, status: InstanceStatus, prior: Option<&ResourceInstanceState>) {
        let mut instance = match prior {
            Some(prior) => {
                let mut instance = prior.clone();
                instance.set_object(object);
                instance.schema_version = change.schema_version;
                instance
            }
            None => ResourceInstanceState::new(change.provider.clone(), change.schema_version, object),
        };
        instance.set_status(status);
        instance.sensitive_paths.clone_from(&change.sensitive_paths);
        instance.dependencies = change.depends_on.iter().cloned().collect();
        self.state.set(change.address.clone(), instance).await;
    }

    /// Records the partial object a failed operation left behind.
    async fn record_partial(&self, change: &Change, error: &ApplyError) {
        if let Some(partial) = error.partial() {
            warn!(address = %change.address, "Recording partial object as tainted");
            self.record(change, partial.clone(), InstanceStatus::Tainted, None).await;
        }
    }

    async fn read(&self, change: &Change) -> Result<(), ApplyError> {
        if let Some(after) = &change.after
            && unknown_paths(after).is_empty()
        {
            self.record(change, ObjectState::new(after.clone()), InstanceStatus::Ready, None)
                .await;
            return Ok(());
        }

        let resource = self.resource(&change.address)?;
        let desired = self.evaluate(resource).await?;
        let provider = self.provider(change)?;
        let address = &change.address;
        let object = self
            .ctx
            .retry()
            .run(address, "read", &self.cancel, || {
                let provider = Arc::clone(&provider);
                let address = address.clone();
                let config = desired.clone();
                async move { provider.read_data(address, config).await.map_err(ProviderFailure::from) }
            })
            .await?;
        self.record(change, object, InstanceStatus::Ready, None).await;
        Ok(())
    }

    async fn delete(&self, change: &Change, prior: &ResourceInstanceState) -> Result<(), ApplyError> {
        let provider = self.provider(change)?;
        let address = &change.address;
        let result = self
            .ctx
            .retry()
            .run(address, "delete", &self.cancel, || {
                let provider = Arc::clone(&provider);
                let request = OperationRequest {
                    address: address.clone(),
                    prior: Some(prior.object()),
                    planned: Attributes::new(),
                };
                async move { provider.delete(request).await }
            })
            .await;

        match result {
            Ok(())
            | Err(ApplyError::OperationFailed {
                source: ProviderError::NotFound,
                ..
            }) => {
                self.state.remove(address).await;
                info!(address = %address, "Deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, change: &Change, planned: &Attributes) -> Result<(), ApplyError> {
        let provider = self.provider(change)?;
        let address = &change.address;
        let result = self
            .ctx
            .retry()
            .run(address, "create", &self.cancel, || {
                let provider = Arc::clone(&provider);
                let request = OperationRequest {
                    address: address.clone(),
                    prior: None,
                    planned: planned.clone(),
                };
                async move { provider.create(request).await }
            })
            .await;

        match result {
            Ok(object) => self.finish(change, object, None).await,
            Err(e) => {
                self.record_partial(change, &e).await;
                Err(e)
            }
        }
    }

    async fn update(&self, change: &Change, prior: &ResourceInstanceState, planned: &Attributes) -> Result<(), ApplyError> {
        let provider = self.provider(change)?;
        let address = &change.address;
        let result = self
            .ctx
            .retry()
            .run(address, "update", &self.cancel, || {
                let provider = Arc::clone(&provider);
                let request = OperationRequest {
                    address: address.clone(),
                    prior: Some(prior.object()),
                    planned: planned.clone(),
                };
                async move { provider.update(request).await }
            })
            .await;

        match result {
            Ok(object) => self.finish(change, object, Some(prior)).await,
            Err(ApplyError::OperationFailed {
                source: ProviderError::RequiresReplace { attributes },
                ..
            }) => {
                info!(address = %address, "Provider requires replacement of {}", attributes.join(", "));
                Err(ApplyError::ReplanRequired {
                    address: address.clone(),
                })
            }
            Err(e) => {
                if let Some(partial) = e.partial() {
                    self.record(change, partial.clone(), InstanceStatus::Ready, Some(prior))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Records a successful create or update. Attributes the provider left
    /// unknown fail the node and taint the instance.
    async fn finish(&self, change: &Change, object: ObjectState, prior: Option<&ResourceInstanceState>) -> Result<(), ApplyError> {
        let unknown = unknown_paths(&object.attributes);
        if !unknown.is_empty() {
            self.record(change, object, InstanceStatus::Tainted, prior).await;
            return Err(ApplyError::UnknownAfterApply {
                address: change.address.clone(),
                attributes: unknown,
            });
        }
        self.record(change, object, InstanceStatus::Ready, prior).await;
        info!(address = %change.address, action = %change.action, "Applied");
        Ok(())
    }

    /// Re-diffs with final reference values, then creates, updates or
    /// replaces.
    async fn converge(&self, change: &Change) -> Result<(), ApplyError> {
        let address = &change.address;
        let resource = self.resource(address)?;
        let desired = self.evaluate(resource).await?;
        let schema = self.schema(change)?;
        let prior = self.state.get(address).await;
        let ignore_changes = resource
            .lifecycle
            .ignore_changes
            .iter()
            .map(|p| p.parse::<AttrPath>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| evaluation_error(address, e))?;

        let force_replace = match change.action {
            Action::Replace => change.replace_reason.or(Some(ReplaceReason::Requested)),
            _ => None,
        };
        let mut final_change = DiffEngine::new()
            .diff(DiffRequest {
                address,
                provider: &change.provider,
                prior: prior.as_ref(),
                desired: Some(desired),
                schema,
                ignore_changes: &ignore_changes,
                force_replace,
            })
            .map_err(|e| evaluation_error(address, e))?;
        final_change.depends_on.clone_from(&change.depends_on);

        let planned = final_change.after.clone().unwrap_or_default();
        match (change.action, final_change.action) {
            (Action::Update, Action::NoOp) => {
                debug!(address = %address, "Change became a no-op once references were known");
                if let Some(prior) = &prior {
                    self.record(&final_change, prior.object(), prior.status, Some(prior)).await;
                }
                Ok(())
            }
            (Action::Update, Action::Replace) => Err(ApplyError::ReplanRequired {
                address: address.clone(),
            }),
            (_, Action::Update) => match &prior {
                Some(prior) => self.update(&final_change, prior, &planned).await,
                None => self.create(&final_change, &planned).await,
            },
            (_, Action::Replace) => {
                if let Some(prior) = &prior {
                    self.delete(&final_change, prior).await?;
                }
                self.create(&final_change, &planned).await
            }
            _ => self.create(&final_change, &planned).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, resolve};
    use crate::provider::{MockProvider, ProviderRegistry};
    use crate::state::StateSnapshot;
    use crate::testing::FakeProvider;
    use crate::value::ValueType;

    fn executor_with(provider: Arc<dyn Provider>, yaml: &str, snapshot: StateSnapshot) -> ApplyExecutor {
        let mut registry = ProviderRegistry::new();
        registry.register("null", provider);
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let ctx = EngineContext::new(registry, &config);
        ApplyExecutor::new(
            Arc::new(ctx),
            Arc::new(resolve(&config).unwrap()),
            WorkingState::new(snapshot),
            CancellationToken::new(),
        )
    }

    const ONE: &str = "project:\n  name: demo\nresources:\n  - type: null_resource\n    name: a\n";

    fn create_change() -> Change {
        let mut change = Change::no_op(ResourceAddress::new("null_resource", "a"), "null", ObjectState::default());
        change.action = Action::Create;
        change.before = None;
        change
    }

    #[tokio::test]
    async fn test_no_op_never_calls_provider() {
        // Only the schema is expected; any operation call panics.
        let mut mock = MockProvider::new();
        mock.expect_schema().returning(|| FakeProvider::new().schema());

        let address = ResourceAddress::new("null_resource", "a");
        let instance = ResourceInstanceState::new("null", 0, ObjectState::default());
        let mut state = StateSnapshot::new();
        state.insert(address.clone(), instance.clone());
        let executor = executor_with(Arc::new(mock), ONE, state);

        let change = Change::no_op(address.clone(), "null", instance.object());
        executor.apply(&change).await.unwrap();
        assert_eq!(executor.state().get(&address).await, Some(instance));
    }

    #[tokio::test]
    async fn test_create_records_instance() {
        let fake = Arc::new(FakeProvider::new());
        let executor = executor_with(fake.clone(), ONE, StateSnapshot::new());
        executor.apply(&create_change()).await.unwrap();

        let recorded = executor
            .state()
            .get(&ResourceAddress::new("null_resource", "a"))
            .await
            .unwrap();
        assert!(recorded.attributes.contains_key("id"));
        assert!(!recorded.is_tainted());
        assert_eq!(fake.calls("create"), 1);
    }

    #[tokio::test]
    async fn test_partial_create_is_recorded_tainted() {
        let fake = Arc::new(FakeProvider::new().fail_with_partial("null_resource.a"));
        let executor = executor_with(fake, ONE, StateSnapshot::new());
        let err = executor.apply(&create_change()).await.unwrap_err();
        assert!(err.partial().is_some());

        let recorded = executor
            .state()
            .get(&ResourceAddress::new("null_resource", "a"))
            .await
            .unwrap();
        assert!(recorded.is_tainted());
        assert_eq!(recorded.attributes.get("id"), Some(&Value::string("partial")));
    }

    #[tokio::test]
    async fn test_unknown_after_create_is_tainted() {
        let mut mock = MockProvider::new();
        mock.expect_schema().returning(|| FakeProvider::new().schema());
        mock.expect_create().times(1).returning(|request| {
            let mut attributes = request.planned;
            attributes.insert("id".to_string(), Value::Unknown(ValueType::String));
            Ok(ObjectState::new(attributes))
        });
        let executor = executor_with(Arc::new(mock), ONE, StateSnapshot::new());

        let err = executor.apply(&create_change()).await.unwrap_err();
        assert!(matches!(
            &err,
            ApplyError::UnknownAfterApply { attributes, .. } if attributes == &vec!["id".to_string()]
        ));

        let recorded = executor
            .state()
            .get(&ResourceAddress::new("null_resource", "a"))
            .await
            .unwrap();
        assert!(recorded.is_tainted());
    }

    #[tokio::test]
    async fn test_destroy_half_removes_prior_only() {
        let fake = Arc::new(FakeProvider::new());
        let address = ResourceAddress::new("null_resource", "a");
        let mut state = StateSnapshot::new();
        state.insert(address.clone(), ResourceInstanceState::new("null", 0, ObjectState::default()));
        let executor = executor_with(fake.clone(), ONE, state);

        let mut change = create_change();
        change.action = Action::Replace;
        executor.destroy(&change).await.unwrap();
        assert!(executor.state().get(&address).await.is_none());
        assert_eq!(fake.calls("delete"), 1);
        assert_eq!(fake.calls("create"), 0);

        executor.apply(&change).await.unwrap();
        assert_eq!(fake.calls("delete"), 1);
        assert_eq!(fake.calls("create"), 1);
        assert!(executor.state().get(&address).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_instance() {
        let fake = Arc::new(FakeProvider::new().fail("null_resource.a"));
        let address = ResourceAddress::new("null_resource", "a");
        let mut state = StateSnapshot::new();
        state.insert(address.clone(), ResourceInstanceState::new("null", 0, ObjectState::default()));
        let executor = executor_with(fake, "project:\n  name: demo\n", state);

        let mut change = Change::no_op(address.clone(), "null", ObjectState::default());
        change.action = Action::Delete;
        change.after = None;
        assert!(executor.apply(&change).await.is_err());
        assert!(executor.state().get(&address).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let mut mock = MockProvider::new();
        mock.expect_schema().returning(|| FakeProvider::new().schema());
        mock.expect_delete()
            .times(1)
            .returning(|_| Err(ProviderError::NotFound.into()));
        let address = ResourceAddress::new("null_resource", "a");
        let mut state = StateSnapshot::new();
        state.insert(address.clone(), ResourceInstanceState::new("null", 0, ObjectState::default()));
        let executor = executor_with(Arc::new(mock), "project:\n  name: demo\n", state);

        let mut change = Change::no_op(address.clone(), "null", ObjectState::default());
        change.action = Action::Delete;
        executor.apply(&change).await.unwrap();
        assert!(executor.state().get(&address).await.is_none());
    }

    #[tokio::test]
    async fn test_requires_replace_is_replan_signal() {
        let mut mock = MockProvider::new();
        mock.expect_schema().returning(|| FakeProvider::new().schema());
        mock.expect_update().times(1).returning(|_| {
            Err(ProviderError::RequiresReplace {
                attributes: vec!["size".to_string()],
            }
            .into())
        });
        let yaml = "project:\n  name: demo\nresources:\n  - type: null_resource\n    name: a\n    attributes:\n      size: 2\n";
        let address = ResourceAddress::new("null_resource", "a");
        let mut attributes = Attributes::new();
        attributes.insert("id".to_string(), Value::string("x"));
        attributes.insert("size".to_string(), Value::Number(1.0));
        let mut state = StateSnapshot::new();
        state.insert(address.clone(), ResourceInstanceState::new("null", 0, ObjectState::new(attributes)));
        let executor = executor_with(Arc::new(mock), yaml, state);

        let mut change = Change::no_op(address.clone(), "null", ObjectState::default());
        change.action = Action::Update;
        let err = executor.apply(&change).await.unwrap_err();
        assert!(err.is_replan_signal());
        let recorded = executor.state().get(&address).await.unwrap();
        assert_eq!(recorded.attributes.get("size"), Some(&Value::Number(1.0)));
    }
}
