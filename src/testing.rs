//! Test doubles shared by the engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::address::ResourceAddress;
use crate::engine::{NodeStatus, ProgressEvent, ProgressHook};
use crate::error::{ConvergeError, ProviderError, StateError};
use crate::provider::{
    AttributeSchema, BlockSchema, ObjectState, OperationRequest, OperationResult, Provider,
    ProviderFailure, ProviderSchema, ResourceSchema,
};
use crate::state::{LockInfo, MemoryStateStore, StateSnapshot, StateStore};
use crate::value::{Attributes, Value, ValueType};

#[derive(Debug, Clone, Copy)]
enum Script {
    Fatal,
    Partial,
    RequiresReplaceOnce,
    Retryable(u32),
    Panic,
}

/// In-memory provider for `null_resource` that counts calls, tracks
/// concurrency and fails on demand.
#[derive(Debug, Default)]
pub struct FakeProvider {
    delay: Duration,
    serialize: bool,
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(&'static str, String)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    stopped: AtomicBool,
    remote: Mutex<BTreeMap<String, Attributes>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.serialize = true;
        self
    }

    fn script(self, address: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(address.to_string(), script);
        self
    }

    /// Every operation on `address` fails fatally.
    pub fn fail(self, address: &str) -> Self {
        self.script(address, Script::Fatal)
    }

    /// Create and update on `address` fail, leaving a partial object with
    /// id `partial`.
    pub fn fail_with_partial(self, address: &str) -> Self {
        self.script(address, Script::Partial)
    }

    /// The first update of `address` asks for replacement.
    pub fn require_replace_once(self, address: &str) -> Self {
        self.script(address, Script::RequiresReplaceOnce)
    }

    /// The first `times` operations on `address` fail with a retryable error.
    pub fn flaky(self, address: &str, times: u32) -> Self {
        self.script(address, Script::Retryable(times))
    }

    /// Every operation on `address` panics.
    pub fn panic_on(self, address: &str) -> Self {
        self.script(address, Script::Panic)
    }

    /// Makes the remote object for `id` exist, for import and refresh.
    pub fn put_remote(&self, id: &str, attributes: Attributes) {
        self.remote.lock().unwrap().insert(id.to_string(), attributes);
    }

    /// Removes a remote object behind the engine's back.
    pub fn drop_remote(&self, id: &str) {
        self.remote.lock().unwrap().remove(id);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(op, _)| *op == operation).count()
    }

    pub fn calls_for(&self, address: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, a)| a == address).count()
    }

    /// Every `(operation, address)` call, in order.
    pub fn call_log(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &'static str, address: &ResourceAddress) -> Result<(), ProviderFailure> {
        self.calls.lock().unwrap().push((operation, address.to_string()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let key = address.to_string();
        if matches!(self.scripts.lock().unwrap().get(&key), Some(Script::Panic)) {
            panic!("scripted panic in {operation} of {key}");
        }

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get(&key).copied() {
            Some(Script::Fatal) => Err(ProviderError::fatal("scripted failure").into()),
            Some(Script::Partial) if operation != "delete" => {
                let mut attributes = Attributes::new();
                attributes.insert("id".to_string(), Value::string("partial"));
                Err(ProviderFailure::with_partial(
                    ProviderError::fatal("interrupted midway"),
                    ObjectState::new(attributes),
                ))
            }
            Some(Script::RequiresReplaceOnce) if operation == "update" => {
                scripts.remove(&key);
                Err(ProviderError::RequiresReplace {
                    attributes: vec!["size".to_string()],
                }
                .into())
            }
            Some(Script::Retryable(n)) if n > 0 => {
                scripts.insert(key, Script::Retryable(n - 1));
                Err(ProviderError::retryable("try again").into())
            }
            _ => Ok(()),
        }
    }

    fn fill(&self, mut attributes: Attributes, id: String) -> Attributes {
        attributes.insert("id".to_string(), Value::String(id.clone()));
        self.remote.lock().unwrap().insert(id, attributes.clone());
        attributes
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn schema(&self) -> ProviderSchema {
        let string_map = || ValueType::Map(Box::new(ValueType::String));
        let schema = ProviderSchema::new()
            .with_resource(
                "null_resource",
                ResourceSchema::new(
                    BlockSchema::new()
                        .with_attribute("triggers", AttributeSchema::optional(string_map()).force_new())
                        .with_attribute("size", AttributeSchema::optional(ValueType::Number))
                        .with_attribute("name", AttributeSchema::optional(ValueType::String))
                        .with_attribute("id", AttributeSchema::computed(ValueType::String)),
                ),
            )
            .with_data_source(
                "null_data_source",
                ResourceSchema::new(
                    BlockSchema::new()
                        .with_attribute("inputs", AttributeSchema::optional(string_map()))
                        .with_attribute("id", AttributeSchema::computed(ValueType::String)),
                ),
            );
        if self.serialize { schema.serialized() } else { schema }
    }

    async fn create(&self, request: OperationRequest) -> OperationResult {
        self.enter("create", &request.address).await?;
        let id = format!("id-{}", request.address.name());
        Ok(ObjectState::new(self.fill(request.planned, id)))
    }

    async fn update(&self, request: OperationRequest) -> OperationResult {
        self.enter("update", &request.address).await?;
        let id = request
            .prior
            .as_ref()
            .and_then(|p| p.attributes.get("id"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("id-{}", request.address.name()), str::to_string);
        Ok(ObjectState::new(self.fill(request.planned, id)))
    }

    async fn delete(&self, request: OperationRequest) -> Result<(), ProviderFailure> {
        self.enter("delete", &request.address).await?;
        if let Some(id) = request.prior.as_ref().and_then(|p| p.attributes.get("id")).and_then(Value::as_str) {
            self.remote.lock().unwrap().remove(id);
        }
        Ok(())
    }

    async fn read(&self, address: ResourceAddress, current: ObjectState) -> Result<Option<ObjectState>, ProviderError> {
        self.enter("read", &address).await.map_err(|f| f.error)?;
        let Some(id) = current.attributes.get("id").and_then(Value::as_str) else {
            return Ok(Some(current));
        };
        Ok(self.remote.lock().unwrap().get(id).cloned().map(ObjectState::new))
    }

    async fn read_data(&self, address: ResourceAddress, config: Attributes) -> Result<ObjectState, ProviderError> {
        self.enter("read_data", &address).await.map_err(|f| f.error)?;
        let mut attributes = config;
        attributes.insert("id".to_string(), Value::string("data"));
        Ok(ObjectState::new(attributes))
    }

    async fn import_state(&self, resource_type: String, id: String) -> Result<ObjectState, ProviderError> {
        if resource_type != "null_resource" {
            return Err(ProviderError::fatal(format!("cannot import {resource_type}")));
        }
        self.remote
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .map(ObjectState::new)
            .ok_or(ProviderError::NotFound)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Hook that keeps every event.
#[derive(Debug, Default)]
pub struct CollectingHook {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingHook {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Statuses one address went through, in order.
    pub fn statuses(&self, address: &str) -> Vec<NodeStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.address.to_string() == address)
            .map(|e| e.status)
            .collect()
    }
}

impl ProgressHook for CollectingHook {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Store that keeps state in memory but refuses every write.
#[derive(Debug, Default)]
pub struct ReadOnlyStore {
    inner: MemoryStateStore,
}

#[async_trait]
impl StateStore for ReadOnlyStore {
    async fn read_state(&self) -> crate::error::Result<Option<StateSnapshot>> {
        self.inner.read_state().await
    }

    async fn write_state(&self, _snapshot: &StateSnapshot) -> crate::error::Result<u64> {
        Err(ConvergeError::State(StateError::backend("disk full")))
    }

    async fn exists(&self) -> crate::error::Result<bool> {
        self.inner.exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> crate::error::Result<LockInfo> {
        self.inner.acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> crate::error::Result<()> {
        self.inner.release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> crate::error::Result<Option<LockInfo>> {
        self.inner.get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        "read-only"
    }

    fn location(&self) -> String {
        String::from("memory")
    }
}
