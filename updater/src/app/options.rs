//! Application configuration options

use crate::deploy::orchestrator::OrchestratorOptions;
use crate::deploy::toolchain::{ExecutionContext, ToolchainOptions};
use crate::errors::UpdaterError;
use crate::filter::{FilterOptions, NamePatterns};
use crate::models::mode::VersionPolicy;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Work set selection
    pub filter: FilterOptions,

    /// Device loop switches
    pub orchestrator: OrchestratorOptions,

    /// Build tool access
    pub toolchain: ToolchainOptions,

    /// Domain appended to node names for discovery
    pub mdns_domain: String,

    /// Reset the progress journal before selecting devices
    pub reset_progress: bool,
}

impl AppOptions {
    /// Derive run options from settings
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Result<Self, UpdaterError> {
        let filter = FilterOptions {
            mode: settings.mode,
            include: NamePatterns::new(&settings.device_name_patterns)?,
            exclude: NamePatterns::new(&settings.skip_device_name_patterns)?,
            versions: VersionPolicy {
                update_when_no_deployed_version: settings.update_when_no_deployed_version,
                update_when_version_matches: settings.update_when_version_matches,
            },
            dry_run: settings.dry_run,
            start_from_device: settings.start_from_device.clone(),
            max_devices: settings.max_devices_per_run,
        };

        let orchestrator = OrchestratorOptions {
            stop_on_compilation_error: settings.stop_on_compilation_error,
            stop_on_upload_error: settings.stop_on_upload_error,
            delay_between_updates: settings.delay(),
        };

        let context = if settings.esphome_container.is_empty() {
            ExecutionContext::Host
        } else {
            ExecutionContext::Container {
                name: settings.esphome_container.clone(),
            }
        };
        let toolchain = ToolchainOptions {
            context,
            builds_dir: layout.builds_dir(),
            compile_timeout: settings.compile_timeout(),
            upload_timeout: settings.upload_timeout(),
            probe_timeout: settings.probe_timeout(),
            ..ToolchainOptions::default()
        };

        Ok(Self {
            layout,
            filter,
            orchestrator,
            toolchain,
            mdns_domain: settings.mdns_domain.clone(),
            reset_progress: false,
        })
    }
}
