//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::UpdaterError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Every path the updater reads or writes
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Device configuration directory
    pub config_dir: PathBuf,

    /// Directory holding the progress journal and the persistent log
    pub shared_dir: PathBuf,

    /// Private data directory (options, housekeeping state)
    pub data_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let shared_dir = config_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.clone());
        Self {
            config_dir,
            shared_dir,
            data_dir: data_dir.into(),
        }
    }

    /// Get the device configuration directory
    pub fn config_dir(&self) -> Dir {
        Dir::new(&self.config_dir)
    }

    /// Get the per-device metadata directory
    pub fn metadata_dir(&self) -> Dir {
        Dir::new(self.config_dir.join(".esphome").join("storage"))
    }

    /// Get the directory receiving located firmware
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.config_dir.join("builds"))
    }

    /// Get the progress journal file
    pub fn progress_file(&self) -> File {
        File::new(self.shared_dir.join("esphome_update_progress.json"))
    }

    /// Get the persistent log file
    pub fn log_file(&self) -> File {
        File::new(self.shared_dir.join("esphome_smart_update.log"))
    }

    /// Get the options file
    pub fn options_file(&self) -> File {
        File::new(self.data_dir.join("options.json"))
    }

    /// Get the housekeeping state file
    pub fn state_file(&self) -> File {
        File::new(self.data_dir.join("state.json"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), UpdaterError> {
        Dir::new(&self.shared_dir).create().await?;
        Dir::new(&self.data_dir).create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/config/esphome", "/data")
    }
}
