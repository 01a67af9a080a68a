//! Log and journal clearing decided at startup

use tracing::info;

use crate::storage::settings::Settings;
use crate::storage::state::HousekeepingState;

/// What to clear this run, with the reasons
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingPlan {
    pub clear_log: Vec<String>,
    pub reset_progress: Vec<String>,
}

impl HousekeepingPlan {
    pub fn clears_log(&self) -> bool {
        !self.clear_log.is_empty()
    }

    pub fn resets_progress(&self) -> bool {
        !self.reset_progress.is_empty()
    }

    /// Log what was decided; called once logging is up
    pub fn report(&self) {
        for reason in &self.clear_log {
            info!("Log file cleared ({})", reason);
        }
        for reason in &self.reset_progress {
            info!("Progress journal will be reset ({})", reason);
        }
    }
}

/// Decide housekeeping for this run and the state to persist afterwards.
///
/// One-shot triggers fire once per activation: they are marked consumed when
/// they fire and re-armed when the option is switched off. A dry run never
/// consumes the progress trigger, since it will not reset the journal.
pub fn plan(settings: &Settings, state: &HousekeepingState, updater_version: &str) -> (HousekeepingPlan, HousekeepingState) {
    let mut plan = HousekeepingPlan::default();
    let mut next = state.clone();

    if settings.always_clear_log_on_version_change && state.last_version.as_deref() != Some(updater_version) {
        plan.clear_log.push(format!(
            "updater version changed: {} -> {}",
            state.last_version.as_deref().unwrap_or("none"),
            updater_version
        ));
        next.last_version = Some(updater_version.to_string());
    }

    if settings.clear_log_on_start {
        plan.clear_log.push("clear_log_on_start".to_string());
    }

    if settings.clear_log_now && !state.clear_log_now_consumed {
        plan.clear_log.push("clear_log_now".to_string());
        next.clear_log_now_consumed = true;
    } else if !settings.clear_log_now {
        next.clear_log_now_consumed = false;
    }

    if settings.clear_progress_on_start {
        plan.reset_progress.push("clear_progress_on_start".to_string());
    }

    if settings.clear_progress_now && !state.clear_progress_now_consumed {
        plan.reset_progress.push("clear_progress_now".to_string());
        if !settings.dry_run {
            next.clear_progress_now_consumed = true;
        }
    } else if !settings.clear_progress_now {
        next.clear_progress_now_consumed = false;
    }

    (plan, next)
}
