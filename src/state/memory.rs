//! In-memory state backend.
//!
//! Snapshots are kept serialized so reads and writes go through the same
//! JSON encoding as the persistent backends.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, next_snapshot};
use super::types::StateSnapshot;

/// State store that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<String>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(json: &str) -> Result<StateSnapshot> {
        serde_json::from_str(json)
            .map_err(|e| ConvergeError::State(StateError::corrupted(format!("Failed to parse state: {e}"))))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        self.state.lock().await.as_deref().map(Self::decode).transpose()
    }

    async fn write_state(&self, snapshot: &StateSnapshot) -> Result<u64> {
        let mut slot = self.state.lock().await;
        let persisted = slot.as_deref().map(Self::decode).transpose()?;
        let Some(next) = next_snapshot(persisted.as_ref(), snapshot)? else {
            return Ok(snapshot.serial);
        };
        let json = serde_json::to_string(&next).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;
        *slot = Some(json);
        Ok(next.serial)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(existing.held_error().into());
        }
        let info = LockInfo::new(holder, operation);
        *slot = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.lock_id != lock_id {
                return Err(StateError::LockMismatch {
                    expected: lock_id.to_string(),
                    found: existing.lock_id.clone(),
                }
                .into());
            }
        }
        *slot = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn location(&self) -> String {
        String::from("memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.read_state().await.unwrap().is_none());

        let serial = store.write_state(&StateSnapshot::new()).await.unwrap();
        assert_eq!(serial, 1);

        let loaded = store.read_state().await.unwrap().unwrap();
        assert_eq!(store.write_state(&loaded).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_lock_exclusive() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("a", "apply").await.unwrap();
        assert!(store.acquire_lock("b", "apply").await.is_err());
        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(store.acquire_lock("b", "apply").await.is_ok());
    }
}
