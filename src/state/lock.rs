//! State locking for concurrent access protection.
//!
//! A lock is held for the whole plan and apply cycle. Locks are never
//! broken automatically; a lock older than [`STALE_LOCK_SECS`] is only
//! flagged as probably orphaned in diagnostics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::store::StateStore;
use crate::engine::poll::{PollError, PollOptions, poll_until};
use crate::error::{ConvergeError, Result, StateError};

/// Age after which a lock is reported as probably stale.
pub const STALE_LOCK_SECS: i64 = 3600;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Operation the holder is running.
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// Seconds since the lock was acquired.
    #[must_use]
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.acquired_at).num_seconds().max(0)
    }

    /// Returns true if the lock is old enough to be suspicious.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.age_secs() > STALE_LOCK_SECS
    }

    /// The error reported to a process that finds this lock held.
    #[must_use]
    pub fn held_error(&self) -> StateError {
        StateError::LockedByOther {
            lock_id: self.lock_id.clone(),
            holder: self.holder.clone(),
            operation: self.operation.clone(),
            since: self.acquired_at.to_rfc3339(),
            age_secs: self.age_secs(),
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

enum Attempt {
    Acquired(LockInfo),
    Held(StateError),
}

/// Acquires the lock, retrying while another holder has it for up to
/// `timeout`. A zero timeout tries exactly once.
///
/// # Errors
///
/// Returns [`StateError::LockedByOther`] if the lock is still held when
/// the timeout expires, or any backend error immediately.
pub async fn acquire_with_wait(
    store: &dyn StateStore,
    holder: &str,
    operation: &str,
    timeout: Duration,
) -> Result<LockInfo> {
    let options = PollOptions {
        timeout,
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(5),
        multiplier: 1.5,
    };

    let outcome = poll_until(
        move || async move {
            match store.acquire_lock(holder, operation).await {
                Ok(info) => Ok(Attempt::Acquired(info)),
                Err(ConvergeError::State(held @ StateError::LockedByOther { .. })) => {
                    debug!("State lock is held, waiting: {held}");
                    Ok(Attempt::Held(held))
                }
                Err(e) => Err(e),
            }
        },
        |attempt| matches!(attempt, Attempt::Acquired(_)),
        &options,
    )
    .await;

    match outcome {
        Ok(Attempt::Acquired(info)) => {
            info!(lock_id = %info.lock_id, "Acquired state lock for {operation}");
            Ok(info)
        }
        Ok(Attempt::Held(err)) | Err(PollError::Timeout { last: Attempt::Held(err), .. }) => {
            Err(err.into())
        }
        Err(PollError::Timeout { last: Attempt::Acquired(info), .. }) => Ok(info),
        Err(PollError::Failed(e)) => Err(e),
    }
}
