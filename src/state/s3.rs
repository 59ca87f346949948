//! S3-based state storage backend.
//!
//! This module stores state in AWS S3 (or a compatible service) for team
//! use. The lock object is created with a conditional `PutObject`
//! (`If-None-Match: *`), so two processes can never both believe they
//! hold it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::LockInfo;
use super::store::{StateStore, next_snapshot};
use super::types::{STATE_VERSION, StateSnapshot};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store using credentials from the environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::State(StateError::backend(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::State(StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::backend(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::State(StateError::backend(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let info = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })?;
        Ok(Some(info))
    }

    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let Some(json) = self.get_object(&self.key(STATE_KEY)).await? else {
            return Ok(None);
        };
        let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse state: {e}")))
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
impl StateStore for S3StateStore {
    async fn read_state(&self) -> Result<Option<StateSnapshot>> {
        debug!("Loading state from {}", self.location());
        let snapshot = self.read_snapshot().await?;
        if let Some(s) = &snapshot {
            info!("Loaded state serial {} ({} instances)", s.serial, s.resources.len());
        } else {
            debug!("No state found in S3");
        }
        Ok(snapshot)
    }

    async fn write_state(&self, snapshot: &StateSnapshot) -> Result<u64> {
        let persisted = self.read_snapshot().await?;
        let Some(next) = next_snapshot(persisted.as_ref(), snapshot)? else {
            debug!("State unchanged, skipping write (serial {})", snapshot.serial);
            return Ok(snapshot.serial);
        };

        info!("Saving state to {} (serial {})", self.location(), next.serial);

        let content = serde_json::to_string_pretty(&next).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })?;

        self.put_object(&self.key(STATE_KEY), &content).await?;
        Ok(next.serial)
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(ConvergeError::State(StateError::backend(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(content.into_bytes().into())
            .content_type("application/json")
            .if_none_match("*")
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!("Acquired state lock: {}", lock_info.lock_id);
                Ok(lock_info)
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if matches!(
                    service_err.code(),
                    Some("PreconditionFailed" | "ConditionalRequestConflict")
                ) {
                    let existing = self.read_lock().await?;
                    return Err(ConvergeError::State(existing.map_or_else(
                        || StateError::LockFailed {
                            message: String::from("lock object vanished while being inspected"),
                        },
                        |info| info.held_error(),
                    )));
                }
                Err(ConvergeError::State(StateError::LockFailed {
                    message: format!("S3 lock error: {service_err}"),
                }))
            }
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let Some(existing) = self.read_lock().await? else {
            warn!("Lock {lock_id} was already released");
            return Ok(());
        };

        if existing.lock_id != lock_id {
            return Err(ConvergeError::State(StateError::LockMismatch {
                expected: lock_id.to_string(),
                found: existing.lock_id,
            }));
        }

        self.delete_object(&self.key(LOCK_KEY)).await?;
        info!("Released state lock: {lock_id}");
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/team/prod/")), "team/prod/");
        assert_eq!(normalize_prefix(Some("env")), "env/");
    }
}
