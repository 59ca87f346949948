//! Local file-based state storage backend.
//!
//! This module provides a file-based state store for single-machine use.
//! Writes go to a temporary file that is renamed over the state file, and
//! the lock is a fully written file hard-linked into place, so a second
//! holder either sees a complete lock or wins the race itself.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, next_snapshot};
use super::types::{STATE_VERSION, StateSnapshot};

/// Default state directory name.
const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under `.converge` in the current
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path. The
    /// lock file sits next to it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!(
                "Failed to create state directory {}: {e}",
                self.base_dir.display()
            )))
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!(
                "Failed to parse lock file {}: {e}",
                self.lock_path.display()
            )))
        })?;

        Ok(Some(lock_info))
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvergeError::State(StateError::backend(format!(
                    "Failed to read state file: {e}"
                ))));
            }
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse state file: {e}")))
        })?;

        if snapshot.version > STATE_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: snapshot.version,
            }));
        }

        Ok(Some(snapshot))
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        let snapshot = self.read_snapshot().await?;
        match &snapshot {
            Some(s) => info!(
                "Loaded state from {} (serial {}, {} instances)",
                self.state_path.display(),
                s.serial,
                s.resources.len()
            ),
            None => debug!("State file does not exist: {}", self.state_path.display()),
        }
        Ok(snapshot)
    }

    async fn write_state(&self, snapshot: &StateSnapshot) -> Result<u64> {
        let persisted = self.read_snapshot().await?;
        let Some(next) = next_snapshot(persisted.as_ref(), snapshot)? else {
            debug!("State unchanged, skipping write (serial {})", snapshot.serial);
            return Ok(snapshot.serial);
        };

        self.ensure_dir().await?;
        info!("Saving state to {} (serial {})", self.state_path.display(), next.serial);

        let content = serde_json::to_string_pretty(&next).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to create temp state file: {e}")))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to sync state file: {e}")))
        })?;
        drop(file);

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to rename state file: {e}")))
        })?;

        Ok(next.serial)
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        // The lock appears complete or not at all: write it aside, then link it
        // into place. Linking fails if another holder got there first.
        let temp_path = self.lock_path.with_extension(format!("lock.{}.tmp", lock_info.lock_id));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await
        }
        .await;

        let linked = match written {
            Ok(()) => fs::hard_link(&temp_path, &self.lock_path).await,
            Err(e) => Err(e),
        };
        if let Err(cleanup) = fs::remove_file(&temp_path).await
            && cleanup.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove temporary lock file: {cleanup}");
        }

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.read_lock_file().await?;
                return Err(ConvergeError::State(existing.map_or_else(
                    || StateError::LockFailed {
                        message: String::from("lock file vanished while being inspected"),
                    },
                    |info| info.held_error(),
                )));
            }
            Err(e) => {
                return Err(ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        }

        debug!("Acquired state lock: {}", lock_info.lock_id);
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let Some(existing) = self.read_lock_file().await? else {
            warn!("Lock {lock_id} was already released");
            return Ok(());
        };

        if existing.lock_id != lock_id {
            return Err(ConvergeError::State(StateError::LockMismatch {
                expected: lock_id.to_string(),
                found: existing.lock_id,
            }));
        }

        fs::remove_file(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })
        })?;
        info!("Released state lock: {lock_id}");
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ResourceAddress;
    use crate::provider::ObjectState;
    use crate::state::ResourceInstanceState;
    use crate::value::{Attributes, Value};
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn with_instance(mut snapshot: StateSnapshot, name: &str) -> StateSnapshot {
        let mut attrs = Attributes::new();
        attrs.insert("id".to_string(), Value::string(name));
        snapshot.insert(
            ResourceAddress::new("null_resource", name),
            ResourceInstanceState::new("null", 0, ObjectState::new(attrs)),
        );
        snapshot
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (store, _temp) = create_test_store();

        let snapshot = with_instance(StateSnapshot::new(), "a");
        let serial = store.write_state(&snapshot).await.expect("Failed to write state");
        assert_eq!(serial, 1);

        let loaded = store
            .read_state()
            .await
            .expect("Failed to read state")
            .expect("State should exist");

        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.resources, snapshot.resources);
        assert_eq!(loaded.lineage, snapshot.lineage);
    }

    #[tokio::test]
    async fn test_round_trip_write_is_noop() {
        let (store, _temp) = create_test_store();
        store
            .write_state(&with_instance(StateSnapshot::new(), "a"))
            .await
            .unwrap();

        let loaded = store.read_state().await.unwrap().unwrap();
        let before = std::fs::read_to_string(store.state_path()).unwrap();
        let serial = store.write_state(&loaded).await.unwrap();
        let after = std::fs::read_to_string(store.state_path()).unwrap();

        assert_eq!(serial, loaded.serial);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_stale_writer_rejected() {
        let (store, _temp) = create_test_store();
        store.write_state(&StateSnapshot::new()).await.ok();
        let first = store.read_state().await.unwrap();
        assert!(first.is_some());
        let first = first.unwrap();

        let second = first.clone();
        store.write_state(&with_instance(first, "a")).await.unwrap();

        let err = store.write_state(&with_instance(second, "b")).await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::SerialConflict { .. })));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.read_state().await.expect("Read should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state_reported() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join(STATE_FILE), "{ not json").unwrap();
        let err = store.read_state().await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict_reports_holder() {
        let (store, _temp) = create_test_store();

        let first = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("holder-2", "plan").await.unwrap_err();
        match err {
            ConvergeError::State(StateError::LockedByOther { holder, lock_id, .. }) => {
                assert_eq!(holder, "holder-1");
                assert_eq!(lock_id, first.lock_id);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_attempts_see_complete_lock() {
        let (store, temp) = create_test_store();
        let store = std::sync::Arc::new(store);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            tasks.spawn(async move { store.acquire_lock(&format!("holder-{i}"), "apply").await });
        }

        let mut acquired = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(_) => acquired += 1,
                Err(ConvergeError::State(StateError::LockedByOther { .. })) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(acquired, 1);

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_fails() {
        let (store, _temp) = create_test_store();
        let _lock = store.acquire_lock("holder", "apply").await.unwrap();
        let err = store.release_lock("not-the-id").await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::LockMismatch { .. })));
        assert!(store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("crashed", "apply").await.unwrap();
        store.force_unlock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
        assert!(store.force_unlock(&lock.lock_id).await.is_err());
    }
}
