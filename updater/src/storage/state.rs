//! Housekeeping state persisted between runs

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::UpdaterError;
use crate::filesys::file::File;

/// Remembers consumed one-shot triggers and the last updater version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingState {
    pub last_version: Option<String>,
    pub clear_log_now_consumed: bool,
    pub clear_progress_now_consumed: bool,
}

impl HousekeepingState {
    pub async fn load_or_default(file: &File) -> HousekeepingState {
        if !file.exists().await {
            return HousekeepingState::default();
        }
        match file.read_json().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not read {}: {}; starting fresh", file.path().display(), e);
                HousekeepingState::default()
            }
        }
    }

    pub async fn save(&self, file: &File) -> Result<(), UpdaterError> {
        file.write_json(self).await
    }
}
