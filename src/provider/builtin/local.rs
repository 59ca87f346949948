//! The `local` provider: files on the local filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::attr_str;
use crate::address::ResourceAddress;
use crate::error::ProviderError;
use crate::provider::{
    AttributeSchema, BlockSchema, ObjectState, OperationRequest, OperationResult, Provider,
    ProviderFailure, ProviderSchema, ResourceSchema,
};
use crate::value::{Attributes, Value, ValueType};

const DEFAULT_FILE_PERMISSION: &str = "0644";

/// Manages `local_file` resources and reads `local_file` data sources.
#[derive(Debug, Default)]
pub struct LocalProvider {
    stopped: AtomicBool,
}

impl LocalProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_stopped(&self) -> Result<(), ProviderError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn file_schema() -> ResourceSchema {
        ResourceSchema::new(
            BlockSchema::new()
                .with_attribute(
                    "filename",
                    AttributeSchema::required(ValueType::String).force_new(),
                )
                .with_attribute("content", AttributeSchema::optional(ValueType::String))
                .with_attribute(
                    "sensitive_content",
                    AttributeSchema::optional(ValueType::String).sensitive(),
                )
                .with_attribute(
                    "file_permission",
                    AttributeSchema::optional(ValueType::String)
                        .force_new()
                        .with_default(DEFAULT_FILE_PERMISSION),
                )
                .with_attribute("id", AttributeSchema::computed(ValueType::String))
                .with_attribute(
                    "content_sha256",
                    AttributeSchema::computed(ValueType::String)
                        .invalidated_by(&["content", "sensitive_content"]),
                ),
        )
    }

    fn file_data_schema() -> ResourceSchema {
        ResourceSchema::new(
            BlockSchema::new()
                .with_attribute("filename", AttributeSchema::required(ValueType::String))
                .with_attribute("content", AttributeSchema::computed(ValueType::String))
                .with_attribute("content_sha256", AttributeSchema::computed(ValueType::String))
                .with_attribute("id", AttributeSchema::computed(ValueType::String)),
        )
    }

    async fn write_file(planned: &Attributes) -> OperationResult {
        let filename = attr_str(planned, "filename")
            .ok_or_else(|| ProviderError::fatal("filename is not set"))?;
        let path = PathBuf::from(filename);
        let content = attr_str(planned, "content")
            .or_else(|| attr_str(planned, "sensitive_content"))
            .unwrap_or_default();
        let permission = attr_str(planned, "file_permission").unwrap_or(DEFAULT_FILE_PERMISSION);
        let mode = u32::from_str_radix(permission, 8)
            .map_err(|_| ProviderError::fatal(format!("invalid file_permission \"{permission}\"")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&e, parent))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error(&e, &path))?;

        let mut attributes = planned.clone();
        attributes.insert("id".to_string(), Value::string(filename));
        attributes.insert("content_sha256".to_string(), Value::string(digest(content.as_bytes())));
        attributes.insert("file_permission".to_string(), Value::string(permission));
        let object = ObjectState::new(attributes);

        if let Err(e) = set_mode(&path, mode).await {
            return Err(ProviderFailure::with_partial(io_error(&e, &path), object));
        }

        debug!("Wrote {} ({} bytes)", path.display(), content.len());
        Ok(object)
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn io_error(e: &io::Error, path: &Path) -> ProviderError {
    match e.kind() {
        io::ErrorKind::NotFound => ProviderError::NotFound,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ProviderError::retryable(format!("{}: {e}", path.display()))
        }
        _ => ProviderError::fatal(format!("{}: {e}", path.display())),
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn read_mode(path: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path).await.map_or_else(
        |_| DEFAULT_FILE_PERMISSION.to_string(),
        |m| format!("{:04o}", m.permissions().mode() & 0o7777),
    )
}

#[cfg(not(unix))]
async fn read_mode(_path: &Path) -> String {
    DEFAULT_FILE_PERMISSION.to_string()
}

#[async_trait]
impl Provider for LocalProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema::new()
            .with_resource("local_file", Self::file_schema())
            .with_data_source("local_file", Self::file_data_schema())
    }

    async fn create(&self, request: OperationRequest) -> OperationResult {
        self.check_stopped()?;
        Self::write_file(&request.planned).await
    }

    async fn update(&self, request: OperationRequest) -> OperationResult {
        self.check_stopped()?;
        let prior_name = request
            .prior
            .as_ref()
            .and_then(|p| attr_str(&p.attributes, "filename"));
        if prior_name.is_some() && prior_name != attr_str(&request.planned, "filename") {
            return Err(ProviderError::RequiresReplace {
                attributes: vec!["filename".to_string()],
            }
            .into());
        }
        Self::write_file(&request.planned).await
    }

    async fn delete(&self, request: OperationRequest) -> Result<(), ProviderFailure> {
        self.check_stopped()?;
        let filename = request
            .prior
            .as_ref()
            .and_then(|p| attr_str(&p.attributes, "filename"))
            .ok_or_else(|| ProviderError::fatal("filename is not recorded"))?;
        let path = Path::new(filename);
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| ProviderFailure::new(io_error(&e, path)))
    }

    async fn read(
        &self,
        _address: ResourceAddress,
        current: ObjectState,
    ) -> Result<Option<ObjectState>, ProviderError> {
        self.check_stopped()?;
        let Some(filename) = attr_str(&current.attributes, "filename") else {
            return Ok(None);
        };
        let path = PathBuf::from(filename);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&e, &path)),
        };

        let sha = digest(&bytes);
        if attr_str(&current.attributes, "content_sha256") == Some(sha.as_str()) {
            return Ok(Some(current));
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let mut refreshed = current;
        let field = if refreshed
            .attributes
            .get("sensitive_content")
            .is_some_and(|v| !v.is_null())
        {
            "sensitive_content"
        } else {
            "content"
        };
        refreshed.attributes.insert(field.to_string(), Value::String(text));
        refreshed
            .attributes
            .insert("content_sha256".to_string(), Value::String(sha));
        Ok(Some(refreshed))
    }

    async fn read_data(
        &self,
        _address: ResourceAddress,
        config: Attributes,
    ) -> Result<ObjectState, ProviderError> {
        self.check_stopped()?;
        let filename =
            attr_str(&config, "filename").ok_or_else(|| ProviderError::fatal("filename is not set"))?;
        let path = PathBuf::from(filename);
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProviderError::fatal(format!("{filename}: file does not exist")),
            _ => io_error(&e, &path),
        })?;

        let mut attributes = config.clone();
        attributes.insert("id".to_string(), Value::string(filename));
        attributes.insert("content_sha256".to_string(), Value::string(digest(&bytes)));
        attributes.insert(
            "content".to_string(),
            Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        );
        Ok(ObjectState::new(attributes))
    }

    async fn import_state(
        &self,
        resource_type: String,
        id: String,
    ) -> Result<ObjectState, ProviderError> {
        self.check_stopped()?;
        if resource_type != "local_file" {
            return Err(ProviderError::fatal(format!("cannot import {resource_type}")));
        }
        let path = PathBuf::from(&id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(&e, &path))?;

        let mut attributes = Attributes::new();
        attributes.insert("filename".to_string(), Value::string(id.as_str()));
        attributes.insert("id".to_string(), Value::string(id.as_str()));
        attributes.insert("content_sha256".to_string(), Value::string(digest(&bytes)));
        attributes.insert(
            "content".to_string(),
            Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        );
        attributes.insert("sensitive_content".to_string(), Value::Null);
        attributes.insert("file_permission".to_string(), Value::String(read_mode(&path).await));
        Ok(ObjectState::new(attributes))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
