//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the serial/lineage rules every backend applies on write.

use async_trait::async_trait;
use chrono::Utc;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::{ConvergeError, Result, StateError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the persisted snapshot.
    ///
    /// Returns `None` if no state exists yet.
    async fn read_state(&self) -> Result<Option<StateSnapshot>>;

    /// Writes a snapshot and returns the serial it was persisted at.
    ///
    /// Writing content identical to what is persisted does nothing and
    /// returns the current serial.
    async fn write_state(&self, snapshot: &StateSnapshot) -> Result<u64>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the exclusive state lock.
    ///
    /// Fails with [`StateError::LockedByOther`] if someone else holds it.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock previously acquired with the given id.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some())
    }

    /// Removes a lock left behind by another process. The caller must
    /// present the lock id shown in the lock diagnostic.
    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        let Some(existing) = self.get_lock_info().await? else {
            return Err(StateError::LockFailed {
                message: String::from("state is not locked"),
            }
            .into());
        };
        if existing.lock_id != lock_id {
            return Err(StateError::LockMismatch {
                expected: lock_id.to_string(),
                found: existing.lock_id,
            }
            .into());
        }
        self.release_lock(lock_id).await
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Human readable location of the state.
    fn location(&self) -> String;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        (**self).read_state().await
    }

    async fn write_state(&self, snapshot: &StateSnapshot) -> Result<u64> {
        (**self).write_state(snapshot).await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        (**self).force_unlock(lock_id).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Decides what a backend must persist for `snapshot`, given what it
/// currently holds.
///
/// Returns `None` when the content is unchanged. Otherwise returns the
/// snapshot stamped with the next serial.
///
/// # Errors
///
/// Returns a conflict if the persisted state has a different lineage, or
/// a serial other than the one `snapshot` was read at.
pub fn next_snapshot(
    persisted: Option<&StateSnapshot>,
    snapshot: &StateSnapshot,
) -> Result<Option<StateSnapshot>> {
    if let Some(current) = persisted {
        if current.lineage != snapshot.lineage {
            return Err(ConvergeError::State(StateError::LineageMismatch {
                expected: snapshot.lineage.clone(),
                found: current.lineage.clone(),
            }));
        }
        if current.serial != snapshot.serial {
            return Err(ConvergeError::State(StateError::SerialConflict {
                expected: snapshot.serial,
                found: current.serial,
            }));
        }
        if current.same_content(snapshot) {
            return Ok(None);
        }
    }

    let mut next = snapshot.clone();
    next.serial = snapshot.serial + 1;
    next.last_updated = Utc::now();
    Ok(Some(next))
}
