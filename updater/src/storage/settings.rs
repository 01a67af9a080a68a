//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::mode::OperatingMode;

/// Updater settings, read from the add-on options file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Operating mode
    pub mode: OperatingMode,

    /// Only devices matching one of these patterns are considered (empty = all)
    #[serde(alias = "update_only_these")]
    pub device_name_patterns: Vec<String>,

    /// Devices matching one of these patterns are skipped
    pub skip_device_name_patterns: Vec<String>,

    pub update_when_no_deployed_version: bool,
    pub update_when_version_matches: bool,

    /// Classify only, never invoke tools or write state
    pub dry_run: bool,

    /// Log level
    pub log_level: LogLevel,

    pub stop_on_compilation_error: bool,
    pub stop_on_upload_error: bool,

    pub clear_log_on_start: bool,
    pub clear_progress_on_start: bool,

    /// One-shot: truncate the log on the next run
    pub clear_log_now: bool,

    /// One-shot: reset the progress journal on the next run
    pub clear_progress_now: bool,

    pub always_clear_log_on_version_change: bool,

    /// Build container name; empty runs the build tool on this host
    pub esphome_container: String,

    /// Seconds to wait between devices
    pub delay_between_updates: u64,

    /// 0 = unlimited
    pub max_devices_per_run: usize,

    pub start_from_device: Option<String>,

    /// Domain appended to node names for discovery
    pub mdns_domain: String,

    pub compile_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub tool_probe_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Normal,
            device_name_patterns: Vec::new(),
            skip_device_name_patterns: Vec::new(),
            update_when_no_deployed_version: false,
            update_when_version_matches: false,
            dry_run: false,
            log_level: LogLevel::Normal,
            stop_on_compilation_error: false,
            stop_on_upload_error: false,
            clear_log_on_start: false,
            clear_progress_on_start: false,
            clear_log_now: false,
            clear_progress_now: false,
            always_clear_log_on_version_change: true,
            esphome_container: "addon_15ef4d2f_esphome".to_string(),
            delay_between_updates: 3,
            max_devices_per_run: 0,
            start_from_device: None,
            mdns_domain: "local".to_string(),
            compile_timeout_secs: 900,
            upload_timeout_secs: 300,
            tool_probe_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing or malformed
    pub async fn load_or_default(file: &File) -> Settings {
        if !file.exists().await {
            debug!("No options file at {}, using defaults", file.path().display());
            return Settings::default();
        }
        match file.read_json::<Settings>().await {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                warn!("Could not read options from {}: {}; using defaults", file.path().display(), e);
                Settings::default()
            }
        }
    }

    fn normalized(mut self) -> Self {
        self.start_from_device = self
            .start_from_device
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.esphome_container = self.esphome_container.trim().to_string();
        self
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_probe_timeout_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_between_updates)
    }
}
