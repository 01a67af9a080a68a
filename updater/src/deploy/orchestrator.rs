//! Update state machine driver.
//!
//! Processes the work set strictly one device at a time. Each device ends in
//! a terminal state that is flushed to the journal before the next device
//! starts; shutdown is checked between devices and propagated to the
//! in-flight tool through the runner.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{DeviceEvent, DeviceFsm, DeviceState};
use crate::deploy::resolver::{DeliveryReport, DeliveryResolver};
use crate::deploy::toolchain::{Artifact, Toolchain};
use crate::errors::{FailureClass, ToolError, UpdaterError};
use crate::filter::WorkSet;
use crate::inventory::metadata::MetadataStore;
use crate::journal::{Journal, Outcome};
use crate::logs::SUMMARY;
use crate::models::device::UpdateTask;
use crate::models::mode::OperatingMode;
use crate::shutdown::Shutdown;

/// Run-level switches
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub stop_on_compilation_error: bool,
    pub stop_on_upload_error: bool,

    /// Pause between consecutive devices
    pub delay_between_updates: Duration,
}

/// What happened to one device
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub id: String,
    pub state: DeviceState,
    pub failure: Option<FailureClass>,

    /// State the device failed in, for phase attribution
    pub failed_in: Option<DeviceState>,

    pub delivery: DeliveryReport,

    /// Classification only, nothing was invoked
    pub dry_run: bool,
}

/// Result of processing a work set
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub devices: Vec<DeviceReport>,

    /// Policy exclusions recorded as skipped
    pub skipped: Vec<String>,

    /// Devices never started because of halt or shutdown
    pub not_started: Vec<String>,

    pub halted: Option<String>,
    pub interrupted: bool,
}

impl RunReport {
    pub fn count(&self, state: DeviceState) -> usize {
        self.devices.iter().filter(|d| d.state == state).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices.iter().filter(|d| d.state == DeviceState::Failed)
    }
}

pub struct Orchestrator {
    toolchain: Arc<Toolchain>,
    resolver: DeliveryResolver,
    metadata: Arc<dyn MetadataStore>,
    journal: Journal,
    options: OrchestratorOptions,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(
        toolchain: Arc<Toolchain>,
        resolver: DeliveryResolver,
        metadata: Arc<dyn MetadataStore>,
        journal: Journal,
        options: OrchestratorOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            toolchain,
            resolver,
            metadata,
            journal,
            options,
            shutdown,
        }
    }

    /// Process every task of the work set.
    ///
    /// Device failures are recorded and the loop continues. Journal flush
    /// errors abort the run, since resume safety can no longer be kept.
    pub async fn run(&mut self, work_set: WorkSet) -> Result<RunReport, UpdaterError> {
        let mut report = RunReport::default();
        let dry_run = work_set.dry_run;

        for skip in work_set.policy_skips() {
            if dry_run {
                info!("DRY RUN: would mark {} skipped ({})", skip.id, skip.reason);
            } else {
                self.journal.record(&skip.id, Outcome::Skipped, Some(&skip.reason)).await?;
            }
            report.skipped.push(skip.id.clone());
        }

        let total = work_set.tasks.len();
        let mut tasks = work_set.tasks.into_iter().enumerate().peekable();

        while let Some((index, task)) = tasks.next() {
            if self.shutdown.is_requested() {
                report.interrupted = true;
                report.not_started.push(task.device.id);
                report.not_started.extend(tasks.by_ref().map(|(_, t)| t.device.id));
                break;
            }

            info!("[{}/{}] {} ({})", index + 1, total, task.device.id, task.mode);
            let device = self.process(&task).await?;

            if device.failure == Some(FailureClass::Interrupted) || self.shutdown.is_requested() {
                report.interrupted = true;
            }
            let halt = device
                .failure
                .and_then(|class| self.halt_reason(&device.id, class, device.failed_in));
            report.devices.push(device);

            if report.interrupted || halt.is_some() {
                if let Some(reason) = &halt {
                    error!(target: SUMMARY, "Stopping run: {}", reason);
                }
                report.halted = halt;
                report.not_started.extend(tasks.by_ref().map(|(_, t)| t.device.id));
                break;
            }

            let more = tasks.peek().is_some();
            if more && !dry_run && !self.options.delay_between_updates.is_zero() && self.pause().await {
                report.interrupted = true;
                report.not_started.extend(tasks.by_ref().map(|(_, t)| t.device.id));
                break;
            }
        }

        if report.interrupted {
            warn!(target: SUMMARY, "Run interrupted; {} device(s) not started", report.not_started.len());
        }
        Ok(report)
    }

    /// Sleep between devices; true when shutdown arrived meanwhile
    async fn pause(&self) -> bool {
        debug!("Waiting {:?} before next device", self.options.delay_between_updates);
        tokio::select! {
            _ = tokio::time::sleep(self.options.delay_between_updates) => false,
            _ = self.shutdown.requested() => true,
        }
    }

    fn halt_reason(&self, id: &str, class: FailureClass, failed_in: Option<DeviceState>) -> Option<String> {
        // Invocation errors count against the phase that raised them
        let tool_error_in = |states: &[DeviceState]| {
            class == FailureClass::ToolError && failed_in.is_some_and(|state| states.contains(&state))
        };
        let compile_phase =
            class.is_compile_phase() || tool_error_in(&[DeviceState::Pending, DeviceState::Compiling]);
        let upload_phase = class.is_upload_phase() || tool_error_in(&[DeviceState::Uploading]);

        if compile_phase && self.options.stop_on_compilation_error {
            Some(format!("{} failed ({}) and stop_on_compilation_error is set", id, class))
        } else if upload_phase && self.options.stop_on_upload_error {
            Some(format!("{} failed ({}) and stop_on_upload_error is set", id, class))
        } else {
            None
        }
    }

    async fn process(&mut self, task: &UpdateTask) -> Result<DeviceReport, UpdaterError> {
        if task.dry_run {
            return Ok(self.dry_run(task));
        }

        let mut fsm = DeviceFsm::new();
        let mut delivery = DeliveryReport::default();

        if let Err(class) = self.drive(task, &mut fsm, &mut delivery).await {
            fsm.process(DeviceEvent::Fail(class))?;
        }

        let device = &task.device;
        let state = fsm.state();
        debug!("{}: {:?}", device.id, fsm.history());
        match (state, fsm.failure()) {
            (DeviceState::Failed, Some(class)) => {
                error!(target: SUMMARY, "{}: FAILED ({})", device.id, class);
                self.journal.record(&device.id, Outcome::Failed, Some(class.as_str())).await?;
            }
            (DeviceState::Done, _) => {
                info!(target: SUMMARY, "{}: done", device.id);
                self.journal.record(&device.id, Outcome::Done, None).await?;
            }
            (state, _) => {
                return Err(UpdaterError::TransitionError(format!(
                    "{} left in non-terminal state {:?}",
                    device.id, state
                )));
            }
        }

        Ok(DeviceReport {
            id: device.id.clone(),
            state,
            failure: fsm.failure(),
            failed_in: fsm.failed_in(),
            delivery,
            dry_run: false,
        })
    }

    /// Walk the device to `Done`, or return the class it failed with
    async fn drive(
        &self,
        task: &UpdateTask,
        fsm: &mut DeviceFsm,
        delivery: &mut DeliveryReport,
    ) -> Result<(), FailureClass> {
        let device = &task.device;
        let phases = task.mode.phases();
        let names = artifact_names(task);

        let artifact = if phases.compile {
            transition(fsm, DeviceEvent::StartCompile)?;
            info!("{}: compiling {}", device.id, device.config_file);

            let output = self.toolchain.compile(&device.config_file).await.map_err(|e| {
                warn!("{}: compile could not complete: {}", device.id, e);
                compile_error_class(&e)
            })?;
            if !output.success() {
                warn!("{}: compile exited with {}", device.id, output.exit_code);
                for line in output.tail(40) {
                    debug!("  {}", line);
                }
                return Err(FailureClass::CompileFailed);
            }
            debug!("{}: compile finished in {}ms", device.id, output.duration_ms);

            let artifact = self.toolchain.locate_artifact(&names).await.map_err(|e| {
                warn!("{}: artifact lookup failed: {}", device.id, e);
                self.missing_artifact()
            })?;
            if artifact.is_none() && phases.upload {
                warn!("{}: no firmware found after compile", device.id);
                return Err(self.missing_artifact());
            }
            transition(fsm, DeviceEvent::CompileSucceeded)?;
            artifact
        } else {
            let artifact = self.toolchain.existing_artifact(&names).await.map_err(|e| {
                warn!("{}: artifact lookup failed: {}", device.id, e);
                self.missing_artifact()
            })?;
            let Some(artifact) = artifact else {
                warn!("{}: no previously built firmware found", device.id);
                return Err(self.missing_artifact());
            };
            transition(fsm, DeviceEvent::ArtifactReady)?;
            Some(artifact)
        };

        if phases.upload {
            let Some(artifact) = artifact else {
                return Err(FailureClass::ArtifactMissing);
            };
            transition(fsm, DeviceEvent::StartUpload)?;
            *delivery = self.upload(task, &artifact).await;
            if let Some(class) = delivery.failure() {
                return Err(class);
            }
        }

        self.refresh_metadata(task).await?;

        let done = if phases.upload {
            DeviceEvent::UploadSucceeded
        } else {
            DeviceEvent::SkipUpload
        };
        transition(fsm, done)?;
        Ok(())
    }

    /// Lookup probes are cancelled by shutdown and then look like a miss
    fn missing_artifact(&self) -> FailureClass {
        if self.shutdown.is_requested() {
            FailureClass::Interrupted
        } else {
            FailureClass::ArtifactMissing
        }
    }

    async fn upload(&self, task: &UpdateTask, artifact: &Artifact) -> DeliveryReport {
        let report = self.resolver.deliver(&self.toolchain, &task.device, artifact).await;
        if report.attempts.is_empty() {
            warn!("{}: no delivery target (no address and no node name)", task.device.id);
        }
        report
    }

    /// Write the current version as deployed
    async fn refresh_metadata(&self, task: &UpdateTask) -> Result<(), FailureClass> {
        let device = &task.device;
        if !device.current_version_known() {
            warn!("{}: current version unknown, deployed version left unchanged", device.id);
            return Ok(());
        }
        match self
            .metadata
            .record_deployed_version(&device.config_file, &device.current_version)
            .await
        {
            Ok(()) => {
                debug!("{}: deployed version set to {}", device.id, device.current_version);
                Ok(())
            }
            Err(e) if task.mode == OperatingMode::Repair => {
                warn!("{}: could not write metadata: {}", device.id, e);
                Err(FailureClass::MetadataWriteFailed)
            }
            Err(e) => {
                // Firmware is on the device; the next run only repeats work.
                warn!("{}: firmware delivered but metadata not written: {}", device.id, e);
                Ok(())
            }
        }
    }

    fn dry_run(&self, task: &UpdateTask) -> DeviceReport {
        let device = &task.device;
        let phases = task.mode.phases();

        if phases.compile {
            info!("DRY RUN: would compile {}", self.toolchain.tool_config_path(&device.config_file));
        } else {
            info!("DRY RUN: would reuse the last built firmware for {}", device.id);
        }
        if phases.upload {
            let targets = self
                .resolver
                .targets(device)
                .into_iter()
                .map(|t| t.address)
                .collect::<Vec<_>>();
            info!("DRY RUN: would upload {} to [{}]", device.id, targets.join(", "));
        }
        if device.current_version_known() {
            info!(
                "DRY RUN: would set deployed version of {} to {} and mark it done",
                device.id, device.current_version
            );
        } else {
            info!("DRY RUN: would mark {} done", device.id);
        }

        DeviceReport {
            id: device.id.clone(),
            state: DeviceState::Pending,
            failure: None,
            failed_in: None,
            delivery: DeliveryReport::default(),
            dry_run: true,
        }
    }
}

fn transition(fsm: &mut DeviceFsm, event: DeviceEvent) -> Result<(), FailureClass> {
    fsm.process(event).map(|_| ()).map_err(|e| {
        error!("{}", e);
        FailureClass::ToolError
    })
}

fn compile_error_class(error: &ToolError) -> FailureClass {
    match error {
        ToolError::Timeout { .. } => FailureClass::CompileTimeout,
        ToolError::Cancelled { .. } => FailureClass::Interrupted,
        _ => FailureClass::ToolError,
    }
}

/// Build directory names to probe: configuration stem first, then node name
fn artifact_names(task: &UpdateTask) -> Vec<&str> {
    let device = &task.device;
    let mut names = vec![device.id.as_str()];
    if !device.node_name.is_empty() && device.node_name != device.id {
        names.push(device.node_name.as_str());
    }
    names
}
