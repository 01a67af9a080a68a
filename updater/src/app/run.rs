//! Main application run

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::options::AppOptions;
use crate::deploy::fsm::DeviceState;
use crate::deploy::orchestrator::{Orchestrator, RunReport};
use crate::deploy::resolver::DeliveryResolver;
use crate::deploy::runner::{CommandRunner, ProcessRunner};
use crate::deploy::toolchain::Toolchain;
use crate::errors::UpdaterError;
use crate::filter::{self, SkipKind};
use crate::inventory::metadata::{FileMetadataStore, MetadataStore};
use crate::inventory::InventoryScanner;
use crate::journal::store::{FileJournalStore, JournalStore};
use crate::journal::{Journal, ProgressJournal};
use crate::logs::SUMMARY;
use crate::models::device::UNKNOWN_VERSION;
use crate::shutdown::Shutdown;

/// Exit status of a completed run, device failures included
pub const EXIT_OK: i32 = 0;

/// Exit status of an environment, configuration or halt error
pub const EXIT_ERROR: i32 = 1;

/// Exit status of an interrupted run
pub const EXIT_INTERRUPTED: i32 = 130;

/// External capabilities the run depends on
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub metadata: Arc<dyn MetadataStore>,
    pub journal: Arc<dyn JournalStore>,
}

impl Collaborators {
    /// Real processes and file-backed stores
    pub fn production(options: &AppOptions, shutdown: Shutdown) -> Self {
        Self {
            runner: Arc::new(ProcessRunner::new(shutdown)),
            metadata: Arc::new(FileMetadataStore::new(options.layout.metadata_dir())),
            journal: Arc::new(FileJournalStore::new(options.layout.progress_file())),
        }
    }
}

/// Run the selective updater once over the whole fleet
pub async fn run(
    updater_version: &str,
    options: AppOptions,
    collaborators: Collaborators,
    shutdown: Shutdown,
) -> Result<RunReport, UpdaterError> {
    info!(
        target: SUMMARY,
        "ESPHome selective updater {} - mode: {}{}",
        updater_version,
        options.filter.mode,
        if options.filter.dry_run { " (DRY RUN)" } else { "" }
    );

    let toolchain = Arc::new(Toolchain::new(collaborators.runner.clone(), options.toolchain.clone()));
    toolchain.verify_environment().await?;

    let current_version = toolchain.current_version().await;
    info!(target: SUMMARY, "ESPHome version: {}", current_version);
    if current_version == UNKNOWN_VERSION {
        warn!(target: SUMMARY, "ESPHome version unknown: version comparison disabled, metadata left unchanged");
    }

    if shutdown.is_requested() {
        return Err(UpdaterError::Interrupted("before any device was processed".to_string()));
    }

    let config_dir = options.layout.config_dir();
    let scanner = InventoryScanner::new(config_dir.clone(), collaborators.metadata.clone());
    let devices = scanner.scan(&current_version).await?;
    if devices.is_empty() {
        return Err(UpdaterError::EnvironmentError(format!(
            "No device configurations in {}",
            config_dir.path().display()
        )));
    }

    let mut journal = Journal::load(collaborators.journal.clone()).await;
    let dry_run_reset = options.reset_progress && options.filter.dry_run;
    if options.reset_progress && !options.filter.dry_run {
        journal.reset().await?;
        info!("Progress journal reset");
    }

    let work_set = if dry_run_reset {
        info!("DRY RUN: would reset the progress journal");
        filter::select(devices, &options.filter, &ProgressJournal::default())
    } else {
        filter::select(devices, &options.filter, journal.state())
    };
    let already_done = work_set
        .skipped
        .iter()
        .filter(|s| s.kind == SkipKind::AlreadyDone)
        .count();
    debug!("Work set: {:?}", work_set.ids());
    info!(
        target: SUMMARY,
        "{} device(s) selected, {} skipped ({} already done)",
        work_set.tasks.len(),
        work_set.skipped.len(),
        already_done
    );

    let mut orchestrator = Orchestrator::new(
        toolchain,
        DeliveryResolver::new(options.mdns_domain.clone()),
        collaborators.metadata,
        journal,
        options.orchestrator.clone(),
        shutdown,
    );
    let report = orchestrator.run(work_set).await?;

    log_summary(&report, options.filter.dry_run);
    Ok(report)
}

/// Final totals at summary severity
pub fn log_summary(report: &RunReport, dry_run: bool) {
    if dry_run {
        let would_update = report.devices.iter().filter(|d| d.dry_run).count();
        info!(
            target: SUMMARY,
            "DRY RUN complete: {} device(s) would be updated, {} would be skipped; nothing was changed",
            would_update,
            report.skipped.len()
        );
        return;
    }

    info!(
        target: SUMMARY,
        "Run complete: {} done, {} failed, {} skipped, {} not started",
        report.count(DeviceState::Done),
        report.count(DeviceState::Failed),
        report.skipped.len(),
        report.not_started.len()
    );
    for device in report.failed() {
        let class = device.failure.map(|c| c.as_str()).unwrap_or("unknown");
        warn!(target: SUMMARY, "  failed: {} ({})", device.id, class);
    }
    if let Some(reason) = &report.halted {
        warn!(target: SUMMARY, "Run halted: {}", reason);
    }
}

/// Process exit status for a run result
pub fn exit_code(result: &Result<RunReport, UpdaterError>) -> i32 {
    match result {
        Ok(report) if report.interrupted => EXIT_INTERRUPTED,
        Ok(report) if report.halted.is_some() => EXIT_ERROR,
        Ok(_) => EXIT_OK,
        Err(UpdaterError::Interrupted(_)) => EXIT_INTERRUPTED,
        Err(_) => EXIT_ERROR,
    }
}
