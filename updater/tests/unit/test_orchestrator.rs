//! Orchestration tests against a scripted command runner

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use selective_updater::app::options::AppOptions;
use selective_updater::app::run::{run, Collaborators};
use selective_updater::deploy::fsm::DeviceState;
use selective_updater::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use selective_updater::deploy::resolver::{DeliveryResolver, TargetKind};
use selective_updater::deploy::runner::{CommandRunner, ToolCommand, ToolOutput};
use selective_updater::deploy::toolchain::{Toolchain, ToolchainOptions};
use selective_updater::errors::{FailureClass, ToolError, UpdaterError};
use selective_updater::filesys::dir::Dir;
use selective_updater::filter::{select, FilterOptions, NamePatterns};
use selective_updater::inventory::metadata::MemoryMetadataStore;
use selective_updater::journal::store::MemoryJournalStore;
use selective_updater::journal::{Journal, Outcome, ProgressJournal};
use selective_updater::models::device::{DeployedVersion, DeviceRecord, UNKNOWN_VERSION};
use selective_updater::models::mode::OperatingMode;
use selective_updater::shutdown::{Shutdown, ShutdownTrigger};
use selective_updater::storage::layout::StorageLayout;
use selective_updater::storage::settings::Settings;

// ================================ FAKES ===================================== //

type Responder = dyn Fn(&ToolCommand) -> Result<ToolOutput, ToolError> + Send + Sync;

struct FakeRunner {
    calls: Mutex<Vec<ToolCommand>>,
    respond: Box<Responder>,
}

impl FakeRunner {
    fn new(respond: impl Fn(&ToolCommand) -> Result<ToolOutput, ToolError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    fn compiled(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| has(c, "compile"))
            .filter_map(|c| config_of(c).map(str::to_string))
            .collect()
    }

    fn upload_targets(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| has(c, "upload"))
            .filter_map(|c| target_of(c).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &ToolCommand, _timeout: Duration) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(command.clone());
        (self.respond)(command)
    }
}

fn has(command: &ToolCommand, arg: &str) -> bool {
    command.args.iter().any(|a| a == arg)
}

fn config_of(command: &ToolCommand) -> Option<&str> {
    command
        .args
        .iter()
        .find(|a| a.ends_with(".yaml"))
        .and_then(|a| a.rsplit('/').next())
}

fn target_of(command: &ToolCommand) -> Option<&str> {
    let index = command.args.iter().position(|a| a == "--device")?;
    command.args.get(index + 1).map(String::as_str)
}

fn output(exit_code: i32, text: &str) -> Result<ToolOutput, ToolError> {
    Ok(ToolOutput {
        exit_code,
        output: text.to_string(),
        duration_ms: 1,
    })
}

/// Every tool invocation succeeds
fn happy(command: &ToolCommand) -> Result<ToolOutput, ToolError> {
    if has(command, "-c") {
        return output(0, "/data/build/x/.pioenvs/x/firmware.bin\n");
    }
    if has(command, "upload") {
        return output(0, "INFO OTA successful");
    }
    output(0, "")
}

/// Build tool reporting version 1.1, everything else succeeding
fn versioned(command: &ToolCommand) -> Result<ToolOutput, ToolError> {
    if has(command, "esphome") && has(command, "version") {
        return output(0, "Version: ESPHome 1.1");
    }
    happy(command)
}

fn spawn_error() -> Result<ToolOutput, ToolError> {
    Err(ToolError::Spawn {
        program: "docker".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "docker not found"),
    })
}

// =============================== HARNESS ==================================== //

struct Harness {
    runner: Arc<FakeRunner>,
    metadata: Arc<MemoryMetadataStore>,
    journal: Arc<MemoryJournalStore>,
    shutdown: Shutdown,
    _tmp: TempDir,
}

impl Harness {
    fn new(runner: Arc<FakeRunner>, metadata: MemoryMetadataStore) -> Self {
        Self::with_shutdown(runner, metadata, Shutdown::never())
    }

    fn with_shutdown(runner: Arc<FakeRunner>, metadata: MemoryMetadataStore, shutdown: Shutdown) -> Self {
        Self {
            runner,
            metadata: Arc::new(metadata),
            journal: Arc::new(MemoryJournalStore::new()),
            shutdown,
            _tmp: tempfile::tempdir().unwrap(),
        }
    }

    async fn orchestrator(&self, options: OrchestratorOptions) -> Orchestrator {
        let toolchain = Toolchain::new(
            self.runner.clone(),
            ToolchainOptions {
                builds_dir: Dir::new(self._tmp.path().join("builds")),
                engine_sockets: Vec::new(),
                ..ToolchainOptions::default()
            },
        );
        Orchestrator::new(
            Arc::new(toolchain),
            DeliveryResolver::new("local"),
            self.metadata.clone(),
            Journal::load(self.journal.clone()).await,
            options,
            self.shutdown.clone(),
        )
    }

    /// Inventory as a scan would build it from the current metadata
    fn fleet(&self, ids: &[&str], current: &str) -> Vec<DeviceRecord> {
        ids.iter()
            .map(|id| {
                let config_file = format!("{}.yaml", id);
                let mut device = DeviceRecord::unparsed(*id, config_file.clone(), current);
                device.deployed_version = DeployedVersion::from_option(self.metadata.deployed_version(&config_file));
                device
            })
            .collect()
    }
}

fn abc_metadata() -> MemoryMetadataStore {
    MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.1")
}

fn options(mode: OperatingMode) -> FilterOptions {
    FilterOptions {
        mode,
        ..FilterOptions::default()
    }
}

// ================================ TESTS ===================================== //

#[tokio::test]
async fn test_normal_updates_only_outdated_device() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let work_set = select(
        harness.fleet(&["a", "b", "c"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = assert_ok!(orchestrator.run(work_set).await);

    assert_eq!(report.count(DeviceState::Done), 1);
    assert_eq!(harness.runner.compiled(), vec!["a.yaml"]);
    assert_eq!(harness.runner.upload_targets(), vec!["a.local"]);

    let journal = harness.journal.latest();
    assert_eq!(journal.done.iter().collect::<Vec<_>>(), vec!["a"]);
    assert!(journal.failed.is_empty());
    assert!(journal.skipped.is_empty());
    assert_eq!(harness.metadata.deployed_version("a.yaml").as_deref(), Some("1.1"));
}

#[tokio::test]
async fn test_second_normal_run_has_nothing_to_do() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let first = select(
        harness.fleet(&["a", "b", "c"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );
    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    orchestrator.run(first).await.unwrap();

    // Fresh journal: convergence comes from the metadata alone
    let second = select(
        harness.fleet(&["a", "b", "c"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );
    assert!(second.tasks.is_empty());
}

#[tokio::test]
async fn test_repair_compiles_everything_and_never_uploads() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let work_set = select(
        harness.fleet(&["a", "b", "c"], "1.1"),
        &options(OperatingMode::Repair),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.count(DeviceState::Done), 3);
    assert_eq!(harness.runner.compiled(), vec!["a.yaml", "b.yaml", "c.yaml"]);
    assert!(harness.runner.upload_targets().is_empty());
    for config in ["a.yaml", "b.yaml", "c.yaml"] {
        assert_eq!(harness.metadata.deployed_version(config).as_deref(), Some("1.1"));
    }
}

#[tokio::test]
async fn test_static_address_failure_falls_back_to_discovery_once() {
    let runner = FakeRunner::new(|command| {
        if has(command, "upload") {
            return match target_of(command) {
                Some("10.0.0.5") => output(1, "ERROR Connecting to 10.0.0.5:3232 failed"),
                _ => output(0, "INFO OTA successful"),
            };
        }
        happy(command)
    });
    let harness = Harness::new(runner, MemoryMetadataStore::new().with_version("kitchen.yaml", "1.0"));

    let mut fleet = harness.fleet(&["kitchen"], "1.1");
    fleet[0].declared_address = Some("10.0.0.5".to_string());
    let work_set = select(fleet, &options(OperatingMode::Normal), &Default::default());

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(harness.runner.upload_targets(), vec!["10.0.0.5", "kitchen.local"]);
    let device = &report.devices[0];
    assert_eq!(device.state, DeviceState::Done);
    assert_eq!(device.delivery.attempts.len(), 2);
    assert_eq!(
        device.delivery.delivered_to().map(|t| t.kind),
        Some(TargetKind::Discovered)
    );
}

#[tokio::test]
async fn test_all_targets_failing_is_delivery_exhausted() {
    let runner = FakeRunner::new(|command| {
        if has(command, "upload") {
            return output(1, "ERROR no response");
        }
        happy(command)
    });
    let harness = Harness::new(runner, abc_metadata());

    let mut fleet = harness.fleet(&["a", "c"], "1.1");
    fleet[0].declared_address = Some("10.0.0.5".to_string());
    let mut opts = options(OperatingMode::Normal);
    opts.versions.update_when_no_deployed_version = true;
    let work_set = select(fleet, &opts, &Default::default());

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    // Both devices attempted, failures recorded, run continues
    assert_eq!(report.count(DeviceState::Failed), 2);
    assert_eq!(harness.runner.upload_targets(), vec!["10.0.0.5", "a.local", "c.local"]);

    let journal = harness.journal.latest();
    assert_eq!(journal.reasons.get("a").map(String::as_str), Some("delivery_exhausted"));
    assert_eq!(journal.reasons.get("c").map(String::as_str), Some("upload_failed"));
    assert!(journal.done.is_empty());
    assert_eq!(harness.metadata.deployed_version("a.yaml").as_deref(), Some("1.0"));
}

#[tokio::test]
async fn test_compile_failure_halts_when_configured() {
    let runner = FakeRunner::new(|command| {
        if has(command, "compile") && config_of(command) == Some("a.yaml") {
            return output(1, "ERROR Error while reading config");
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness
        .orchestrator(OrchestratorOptions {
            stop_on_compilation_error: true,
            ..OrchestratorOptions::default()
        })
        .await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.halted.is_some());
    assert_eq!(report.not_started, vec!["b".to_string()]);
    assert_eq!(harness.runner.compiled(), vec!["a.yaml"]);

    let journal = harness.journal.latest();
    assert!(journal.failed.contains("a"));
    assert_eq!(journal.outcome_of("b"), None);
}

#[tokio::test]
async fn test_compile_failure_continues_by_default() {
    let runner = FakeRunner::new(|command| {
        if has(command, "compile") && config_of(command) == Some("a.yaml") {
            return Err(ToolError::Timeout {
                program: "docker".to_string(),
                elapsed_ms: 900_000,
            });
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.halted.is_none());
    assert_eq!(report.devices[0].failure, Some(FailureClass::CompileTimeout));
    assert_eq!(report.devices[1].state, DeviceState::Done);
    assert_eq!(harness.journal.flush_count(), 2);
}

#[tokio::test]
async fn test_interrupt_mid_upload_never_marks_done() {
    let (trigger, shutdown) = Shutdown::new();
    let trigger: Arc<ShutdownTrigger> = Arc::new(trigger);
    let fired = trigger.clone();
    let runner = FakeRunner::new(move |command| {
        if has(command, "upload") {
            fired.trigger();
            return Err(ToolError::Cancelled {
                program: "docker".to_string(),
            });
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("x.yaml", "1.0")
        .with_version("y.yaml", "1.0");
    let harness = Harness::with_shutdown(runner, metadata, shutdown);
    let work_set = select(
        harness.fleet(&["x", "y"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.not_started, vec!["y".to_string()]);
    assert_eq!(harness.runner.compiled(), vec!["x.yaml"]);

    let journal = harness.journal.latest();
    assert!(!journal.done.contains("x"));
    assert!(journal.failed.contains("x"));
    assert_eq!(journal.reasons.get("x").map(String::as_str), Some("interrupted"));
    assert_eq!(journal.outcome_of("y"), None);
    assert_eq!(harness.metadata.deployed_version("x.yaml").as_deref(), Some("1.0"));
}

#[tokio::test]
async fn test_upload_only_without_artifact_fails() {
    let runner = FakeRunner::new(|command| {
        if has(command, "-c") {
            return output(0, "");
        }
        if has(command, "cp") {
            return output(1, "Error: No such container:path");
        }
        happy(command)
    });
    let harness = Harness::new(runner, abc_metadata());
    let work_set = select(
        harness.fleet(&["a"], "1.1"),
        &options(OperatingMode::UploadOnly),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices[0].failure, Some(FailureClass::ArtifactMissing));
    assert!(harness.runner.compiled().is_empty());
    assert!(harness.runner.upload_targets().is_empty());
}

#[tokio::test]
async fn test_upload_only_uses_existing_artifact_without_compiling() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let builds = harness._tmp.path().join("builds");
    std::fs::create_dir_all(&builds).unwrap();
    std::fs::write(builds.join("a.bin"), b"firmware").unwrap();

    let work_set = select(
        harness.fleet(&["a"], "1.1"),
        &options(OperatingMode::UploadOnly),
        &Default::default(),
    );
    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices[0].state, DeviceState::Done);
    assert!(harness.runner.compiled().is_empty());
    let upload = harness.runner.calls().into_iter().find(|c| has(c, "upload")).unwrap();
    assert!(upload.args.contains(&"/config/esphome/builds/a.bin".to_string()));
}

#[tokio::test]
async fn test_policy_skips_are_journaled() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let mut opts = options(OperatingMode::Normal);
    opts.exclude = NamePatterns::new(&["test-*"]).unwrap();
    let work_set = select(
        harness.fleet(&["a", "test-bench"], "1.1"),
        &opts,
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    orchestrator.run(work_set).await.unwrap();

    let journal = harness.journal.latest();
    assert_eq!(journal.outcome_of("test-bench"), Some(Outcome::Skipped));
    assert_eq!(journal.outcome_of("a"), Some(Outcome::Done));
    assert!(journal.is_consistent());
}

#[tokio::test]
async fn test_dry_run_invokes_nothing_and_writes_nothing() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let mut opts = options(OperatingMode::Normal);
    opts.dry_run = true;
    opts.exclude = NamePatterns::new(&["test-*"]).unwrap();
    let work_set = select(
        harness.fleet(&["a", "b", "test-bench"], "1.1"),
        &opts,
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices.len(), 1);
    assert!(report.devices[0].dry_run);
    assert_eq!(report.skipped, vec!["test-bench".to_string()]);
    assert!(harness.runner.calls().is_empty());
    assert_eq!(harness.journal.flush_count(), 0);
    assert_eq!(harness.metadata.deployed_version("a.yaml").as_deref(), Some("1.0"));
}

#[tokio::test]
async fn test_compile_spawn_error_halts_when_configured() {
    let runner = FakeRunner::new(|command| {
        if has(command, "compile") {
            return spawn_error();
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness
        .orchestrator(OrchestratorOptions {
            stop_on_compilation_error: true,
            ..OrchestratorOptions::default()
        })
        .await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices.len(), 1);
    assert_eq!(report.devices[0].failure, Some(FailureClass::ToolError));
    assert_eq!(report.devices[0].failed_in, Some(DeviceState::Compiling));
    assert!(report.halted.is_some());
    assert_eq!(report.not_started, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_compile_spawn_error_ignores_upload_halt_switch() {
    let runner = FakeRunner::new(|command| {
        if has(command, "compile") {
            return spawn_error();
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness
        .orchestrator(OrchestratorOptions {
            stop_on_upload_error: true,
            ..OrchestratorOptions::default()
        })
        .await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.halted.is_none());
    assert_eq!(report.count(DeviceState::Failed), 2);
}

#[tokio::test]
async fn test_upload_failure_halts_when_configured() {
    let runner = FakeRunner::new(|command| {
        if has(command, "upload") {
            return output(1, "ERROR Connecting to a.local failed");
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness
        .orchestrator(OrchestratorOptions {
            stop_on_upload_error: true,
            ..OrchestratorOptions::default()
        })
        .await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices[0].failure, Some(FailureClass::UploadFailed));
    assert!(report.halted.is_some());
    assert_eq!(report.not_started, vec!["b".to_string()]);
    assert_eq!(harness.runner.compiled(), vec!["a.yaml"]);
    assert_eq!(harness.journal.latest().outcome_of("b"), None);
}

#[tokio::test]
async fn test_upload_spawn_error_halts_when_configured() {
    let runner = FakeRunner::new(|command| {
        if has(command, "upload") {
            return spawn_error();
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("a.yaml", "1.0")
        .with_version("b.yaml", "1.0");
    let harness = Harness::new(runner, metadata);
    let work_set = select(
        harness.fleet(&["a", "b"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness
        .orchestrator(OrchestratorOptions {
            stop_on_upload_error: true,
            ..OrchestratorOptions::default()
        })
        .await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.devices[0].failure, Some(FailureClass::ToolError));
    assert_eq!(report.devices[0].failed_in, Some(DeviceState::Uploading));
    assert!(report.halted.is_some());
    assert_eq!(report.not_started, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_interrupt_mid_compile_never_marks_done() {
    let (trigger, shutdown) = Shutdown::new();
    let trigger: Arc<ShutdownTrigger> = Arc::new(trigger);
    let fired = trigger.clone();
    let runner = FakeRunner::new(move |command| {
        if has(command, "compile") {
            fired.trigger();
            return Err(ToolError::Cancelled {
                program: "docker".to_string(),
            });
        }
        happy(command)
    });
    let metadata = MemoryMetadataStore::new()
        .with_version("x.yaml", "1.0")
        .with_version("y.yaml", "1.0");
    let harness = Harness::with_shutdown(runner, metadata, shutdown);
    let work_set = select(
        harness.fleet(&["x", "y"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.devices[0].failure, Some(FailureClass::Interrupted));
    assert_eq!(report.not_started, vec!["y".to_string()]);
    assert!(harness.runner.upload_targets().is_empty());

    let journal = harness.journal.latest();
    assert_eq!(journal.reasons.get("x").map(String::as_str), Some("interrupted"));
    assert_eq!(journal.outcome_of("y"), None);
}

#[tokio::test]
async fn test_interrupt_during_artifact_lookup_is_not_a_missing_artifact() {
    let (trigger, shutdown) = Shutdown::new();
    let trigger: Arc<ShutdownTrigger> = Arc::new(trigger);
    let fired = trigger.clone();
    let runner = FakeRunner::new(move |command| {
        if has(command, "-c") {
            fired.trigger();
            return output(-1, "");
        }
        if has(command, "cp") {
            return output(-1, "");
        }
        happy(command)
    });
    let harness = Harness::with_shutdown(runner, abc_metadata(), shutdown);
    let work_set = select(
        harness.fleet(&["a"], "1.1"),
        &options(OperatingMode::Normal),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.devices[0].failure, Some(FailureClass::Interrupted));
    assert!(harness.runner.upload_targets().is_empty());
}

#[tokio::test]
async fn test_unknown_version_is_never_recorded() {
    let harness = Harness::new(FakeRunner::new(happy), abc_metadata());
    let work_set = select(
        harness.fleet(&["a", "c"], UNKNOWN_VERSION),
        &options(OperatingMode::Repair),
        &Default::default(),
    );

    let mut orchestrator = harness.orchestrator(OrchestratorOptions::default()).await;
    let report = orchestrator.run(work_set).await.unwrap();

    assert_eq!(report.count(DeviceState::Done), 2);
    assert_eq!(harness.metadata.deployed_version("a.yaml").as_deref(), Some("1.0"));
    assert_eq!(harness.metadata.deployed_version("c.yaml"), None);
}

// ============================== FULL RUNS =================================== //

/// Configuration directory with one unit per id, plus options for it
fn app(ids: &[&str], settings: Settings) -> (TempDir, AppOptions) {
    let tmp = tempfile::tempdir().unwrap();
    let config_dir = tmp.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    for id in ids {
        std::fs::write(
            config_dir.join(format!("{}.yaml", id)),
            format!("esphome:\n  name: {}\n", id),
        )
        .unwrap();
    }

    let layout = StorageLayout::new(config_dir, tmp.path().join("data"));
    let mut options = AppOptions::from_settings(&settings, layout).unwrap();
    options.toolchain.engine_sockets = Vec::new();
    options.orchestrator.delay_between_updates = Duration::ZERO;
    (tmp, options)
}

struct Stores {
    runner: Arc<FakeRunner>,
    metadata: Arc<MemoryMetadataStore>,
    journal: Arc<MemoryJournalStore>,
}

impl Stores {
    fn new(runner: Arc<FakeRunner>, metadata: MemoryMetadataStore, journal: ProgressJournal) -> Self {
        Self {
            runner,
            metadata: Arc::new(metadata),
            journal: Arc::new(MemoryJournalStore::with_journal(journal)),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            runner: self.runner.clone(),
            metadata: self.metadata.clone(),
            journal: self.journal.clone(),
        }
    }
}

fn a_done() -> ProgressJournal {
    let mut journal = ProgressJournal::default();
    journal.mark("a", Outcome::Done, None);
    journal
}

#[tokio::test]
async fn test_run_resets_progress_before_selecting() {
    let (_tmp, mut options) = app(&["a"], Settings::default());
    options.reset_progress = true;
    let stores = Stores::new(FakeRunner::new(versioned), abc_metadata(), a_done());

    let report = assert_ok!(run("2.1.0", options, stores.collaborators(), Shutdown::never()).await);

    assert_eq!(report.devices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(report.devices[0].state, DeviceState::Done);
    assert_eq!(stores.runner.compiled(), vec!["a.yaml"]);
    // Reset flush, then the outcome of a
    assert_eq!(stores.journal.flush_count(), 2);
    assert!(stores.journal.history()[0].is_empty());
}

#[tokio::test]
async fn test_dry_run_with_reset_selects_like_a_live_run() {
    let settings = Settings {
        dry_run: true,
        ..Settings::default()
    };
    let (_tmp, mut options) = app(&["a"], settings);
    options.reset_progress = true;
    let stores = Stores::new(FakeRunner::new(versioned), abc_metadata(), a_done());

    let report = assert_ok!(run("2.1.0", options, stores.collaborators(), Shutdown::never()).await);

    assert_eq!(report.devices.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    assert!(report.devices[0].dry_run);
    assert!(stores.runner.compiled().is_empty());
    assert_eq!(stores.journal.flush_count(), 0);
    assert_eq!(stores.journal.latest().outcome_of("a"), Some(Outcome::Done));
}

#[tokio::test]
async fn test_environment_error_aborts_before_any_device() {
    let runner = FakeRunner::new(|command| {
        if command.program == "docker" && command.args == ["ps"] {
            return output(1, "Cannot connect to the Docker daemon");
        }
        versioned(command)
    });
    let (_tmp, options) = app(&["a", "b"], Settings::default());
    let stores = Stores::new(runner, abc_metadata(), ProgressJournal::default());

    let error = assert_err!(run("2.1.0", options, stores.collaborators(), Shutdown::never()).await);

    assert!(matches!(error, UpdaterError::EnvironmentError(_)));
    assert!(stores.runner.compiled().is_empty());
    assert_eq!(stores.journal.flush_count(), 0);
}

#[tokio::test]
async fn test_empty_configuration_directory_is_fatal() {
    let (_tmp, options) = app(&[], Settings::default());
    let stores = Stores::new(FakeRunner::new(versioned), MemoryMetadataStore::new(), ProgressJournal::default());

    let error = assert_err!(run("2.1.0", options, stores.collaborators(), Shutdown::never()).await);

    assert!(matches!(error, UpdaterError::EnvironmentError(_)));
    assert!(stores.runner.compiled().is_empty());
}
