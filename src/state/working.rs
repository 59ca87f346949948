//! Working state shared by concurrently applying nodes.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::types::{ResourceInstanceState, StateSnapshot};
use crate::address::ResourceAddress;

/// Synchronized copy of the state being changed by a run.
///
/// Every read and merge goes through this accessor. The graph guarantees
/// at most one node per address, so writers never race on one entry.
#[derive(Debug, Clone)]
pub struct WorkingState {
    inner: Arc<RwLock<StateSnapshot>>,
}

impl WorkingState {
    /// Wraps a snapshot.
    #[must_use]
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Gets a copy of one instance.
    pub async fn get(&self, address: &ResourceAddress) -> Option<ResourceInstanceState> {
        self.inner.read().await.get(address).cloned()
    }

    /// Records an instance.
    pub async fn set(&self, address: ResourceAddress, instance: ResourceInstanceState) {
        self.inner.write().await.insert(address, instance);
    }

    /// Drops an instance.
    pub async fn remove(&self, address: &ResourceAddress) -> Option<ResourceInstanceState> {
        self.inner.write().await.remove(address)
    }

    /// Runs `f` with read access to the whole snapshot.
    pub async fn with_read<T>(&self, f: impl FnOnce(&StateSnapshot) -> T) -> T {
        f(&*self.inner.read().await)
    }

    /// Runs `f` with write access to the whole snapshot.
    pub async fn with_write<T>(&self, f: impl FnOnce(&mut StateSnapshot) -> T) -> T {
        f(&mut *self.inner.write().await)
    }

    /// Copies the current snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.read().await.clone()
    }
}
