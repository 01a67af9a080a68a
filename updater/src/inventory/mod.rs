//! Device inventory scanner.
//!
//! Reads every configuration unit in the configuration directory together
//! with its persisted metadata and produces one [`DeviceRecord`] per unit,
//! sorted by id so that resumed runs walk the fleet in the same order.

pub mod address;
pub mod metadata;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::UpdaterError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::device::{DeployedVersion, DeviceRecord};

use self::address::{block_body, substitutions, AddressChain};
use self::metadata::MetadataStore;

/// Configuration files in the directory that are not devices
const NON_DEVICE_FILES: &[&str] = &["secrets.yaml"];

/// Builds the device inventory for a run
pub struct InventoryScanner {
    config_dir: Dir,
    metadata: Arc<dyn MetadataStore>,
    addresses: AddressChain,
}

impl InventoryScanner {
    pub fn new(config_dir: Dir, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            config_dir,
            metadata,
            addresses: AddressChain::default(),
        }
    }

    /// Scan the inventory.
    ///
    /// Only an unreadable configuration directory is an error; a single
    /// unreadable unit or metadata record degrades to a record without an
    /// address or deployed version.
    pub async fn scan(&self, current_version: &str) -> Result<Vec<DeviceRecord>, UpdaterError> {
        let files = self
            .config_dir
            .list_files_with_extension("yaml")
            .await
            .map_err(|e| {
                UpdaterError::EnvironmentError(format!(
                    "Cannot read configuration directory {}: {}",
                    self.config_dir.path().display(),
                    e
                ))
            })?;

        let mut devices = Vec::with_capacity(files.len());
        for file in files {
            let Some(config_file) = file.name().map(str::to_string) else {
                continue;
            };
            if NON_DEVICE_FILES.contains(&config_file.as_str()) {
                continue;
            }
            devices.push(self.scan_unit(&file, &config_file, current_version).await);
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Found {} device configuration(s)", devices.len());
        Ok(devices)
    }

    async fn scan_unit(&self, file: &File, config_file: &str, current_version: &str) -> DeviceRecord {
        let id = config_file.trim_end_matches(".yaml").to_string();

        let text = match file.read_string().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Unable to read configuration {}: {}", config_file, e);
                return DeviceRecord::unparsed(id, config_file, current_version);
            }
        };

        let declared_address = match self.addresses.extract(&text) {
            Some((address, strategy)) => {
                debug!("{}: declared address {} (via {})", id, address, strategy);
                Some(address)
            }
            None => {
                debug!("{}: no declared address, discovery only", id);
                None
            }
        };

        let deployed_version = match self.metadata.read(config_file).await {
            Ok(Some(meta)) => DeployedVersion::from_option(meta.deployed_version),
            Ok(None) => DeployedVersion::Absent,
            Err(e) => {
                warn!("Unable to read metadata for {}: {}", id, e);
                DeployedVersion::Absent
            }
        };

        DeviceRecord {
            node_name: parse_node_name(&text).unwrap_or_else(|| id.clone()),
            id,
            config_file: config_file.to_string(),
            declared_address,
            deployed_version,
            current_version: current_version.to_string(),
        }
    }
}

/// Node name from the top-level `esphome:` block.
///
/// Falls back to the first `name:` anywhere in the file; `${var}` values are
/// resolved against the `substitutions:` block.
pub fn parse_node_name(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();

    let from_block = lines
        .iter()
        .position(|l| l.trim_end() == "esphome:")
        .and_then(|start| {
            block_body(&lines[start + 1..], 0)
                .into_iter()
                .find_map(|l| name_value(l))
        });

    let raw = from_block.or_else(|| lines.iter().find_map(|l| name_value(l)))?;
    resolve_substitution(&raw, text)
}

fn name_value(line: &str) -> Option<String> {
    let (key, value) = line.trim().split_once(':')?;
    if key.trim() != "name" {
        return None;
    }
    let value = value.split(" #").next().unwrap_or("").trim();
    let value = value.trim_matches(|c| c == '"' || c == '\'');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve_substitution(value: &str, text: &str) -> Option<String> {
    let key = value
        .strip_prefix("${")
        .and_then(|v| v.strip_suffix('}'))
        .or_else(|| value.strip_prefix('$'));

    match key {
        Some(key) => substitutions(text)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v),
        None => Some(value.to_string()),
    }
}
