//! Device records and per-run update tasks

use serde::{Deserialize, Serialize};

use crate::models::mode::OperatingMode;

/// Current version when the build tool cannot report one; never persisted
pub const UNKNOWN_VERSION: &str = "unknown";

/// Deployed version as recorded in a device's metadata.
///
/// `Absent` is its own state and never compares equal to any version string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum DeployedVersion {
    Absent,
    Known(String),
}

impl DeployedVersion {
    pub fn from_option(version: Option<String>) -> Self {
        match version {
            Some(v) if !v.trim().is_empty() => DeployedVersion::Known(v.trim().to_string()),
            _ => DeployedVersion::Absent,
        }
    }

    pub fn as_deref(&self) -> Option<&str> {
        match self {
            DeployedVersion::Absent => None,
            DeployedVersion::Known(v) => Some(v.as_str()),
        }
    }

    /// True only for a known version equal to `current`
    pub fn matches(&self, current: &str) -> bool {
        self.as_deref() == Some(current)
    }
}

impl std::fmt::Display for DeployedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployedVersion::Absent => f.write_str("<absent>"),
            DeployedVersion::Known(v) => f.write_str(v),
        }
    }
}

/// One manageable device, rebuilt from the inventory on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable unique name, the configuration file stem
    pub id: String,

    /// Configuration file name (e.g. `kitchen.yaml`)
    pub config_file: String,

    /// Node name from the `esphome:` block, used for discovery
    pub node_name: String,

    /// Static network address declared in the configuration
    pub declared_address: Option<String>,

    /// Version from the last successful deployment
    pub deployed_version: DeployedVersion,

    /// Version available to compile right now
    pub current_version: String,
}

impl DeviceRecord {
    /// Record for a configuration unit that could not be read or parsed
    pub fn unparsed(id: impl Into<String>, config_file: impl Into<String>, current_version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            node_name: id.clone(),
            id,
            config_file: config_file.into(),
            declared_address: None,
            deployed_version: DeployedVersion::Absent,
            current_version: current_version.into(),
        }
    }

    pub fn current_version_known(&self) -> bool {
        !self.current_version.is_empty() && self.current_version != UNKNOWN_VERSION
    }
}

/// Transient work item created by the filter and consumed by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTask {
    pub device: DeviceRecord,
    pub mode: OperatingMode,
    pub dry_run: bool,
}
