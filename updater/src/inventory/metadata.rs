//! Per-device deployment metadata

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::UpdaterError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Persisted metadata of one device.
///
/// Unknown keys written by the build tool are preserved on rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Version installed by the last successful deployment
    #[serde(default)]
    pub deployed_version: Option<String>,

    /// When `deployed_version` was last written by the updater
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Store of per-device metadata, keyed by configuration file name
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Metadata of a device, `None` when nothing was ever recorded
    async fn read(&self, config_file: &str) -> Result<Option<DeviceMetadata>, UpdaterError>;

    /// Record `version` as the device's deployed version
    async fn record_deployed_version(&self, config_file: &str, version: &str) -> Result<(), UpdaterError>;
}

/// Metadata kept as one `<config_file>.json` per device in a directory
pub struct FileMetadataStore {
    dir: Dir,
}

impl FileMetadataStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    fn file(&self, config_file: &str) -> File {
        self.dir.file(&format!("{}.json", config_file))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn read(&self, config_file: &str) -> Result<Option<DeviceMetadata>, UpdaterError> {
        let file = self.file(config_file);
        if !file.exists().await {
            return Ok(None);
        }
        file.read_json()
            .await
            .map(Some)
            .map_err(|e| UpdaterError::MetadataError(format!("{}: {}", file.path().display(), e)))
    }

    async fn record_deployed_version(&self, config_file: &str, version: &str) -> Result<(), UpdaterError> {
        let file = self.file(config_file);
        // A corrupt record is replaced rather than blocking convergence.
        let mut metadata = match self.read(config_file).await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(_) => DeviceMetadata::default(),
        };
        metadata.deployed_version = Some(version.to_string());
        metadata.deployed_at = Some(Utc::now());
        file.write_json(&metadata)
            .await
            .map_err(|e| UpdaterError::MetadataError(format!("{}: {}", file.path().display(), e)))
    }
}

/// In-memory store, for tests and embedding
#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<HashMap<String, DeviceMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(self, config_file: &str, version: &str) -> Self {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                config_file.to_string(),
                DeviceMetadata {
                    deployed_version: Some(version.to_string()),
                    ..Default::default()
                },
            );
        }
        self
    }

    pub fn deployed_version(&self, config_file: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(config_file).and_then(|m| m.deployed_version.clone())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn read(&self, config_file: &str) -> Result<Option<DeviceMetadata>, UpdaterError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(config_file).cloned())
    }

    async fn record_deployed_version(&self, config_file: &str, version: &str) -> Result<(), UpdaterError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(config_file.to_string()).or_default();
        entry.deployed_version = Some(version.to_string());
        entry.deployed_at = Some(Utc::now());
        Ok(())
    }
}
