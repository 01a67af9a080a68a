//! ESPHome build tool, reached through the execution context

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::deploy::runner::{CommandRunner, ToolCommand, ToolOutput};
use crate::errors::{ToolError, UpdaterError};
use crate::filesys::dir::Dir;
use crate::models::device::UNKNOWN_VERSION;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ESPHome\s+([0-9][^\s]*)").expect("valid regex"));

/// Build root and name arrive as positional parameters, never as script text
const PIO_PROBE_SCRIPT: &str = r#"ls -1 "$1"/"$2"*/.pioenvs/"$2"*/firmware.bin 2>/dev/null | head -n1"#;

/// Output fragments that mean the device accepted the firmware
const UPLOAD_SUCCESS_MARKERS: &[&str] = &["OTA successful", "Successfully uploaded program"];

/// Where the build tool runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Inside a running container, driven with `docker exec`
    Container { name: String },

    /// Directly on this host
    Host,
}

impl ExecutionContext {
    fn describe(&self) -> String {
        match self {
            ExecutionContext::Container { name } => format!("container '{}'", name),
            ExecutionContext::Host => "host".to_string(),
        }
    }
}

/// Toolchain settings
#[derive(Debug, Clone)]
pub struct ToolchainOptions {
    pub context: ExecutionContext,

    /// Configuration directory as seen by the build tool
    pub tool_config_dir: String,

    /// PlatformIO build root as seen by the build tool
    pub tool_build_root: String,

    /// Directory receiving located artifacts, shared with the build tool
    pub builds_dir: Dir,

    /// Candidate container-engine sockets; empty skips the socket check
    pub engine_sockets: Vec<PathBuf>,

    pub compile_timeout: Duration,
    pub upload_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ToolchainOptions {
    fn default() -> Self {
        Self {
            context: ExecutionContext::Container {
                name: "addon_15ef4d2f_esphome".to_string(),
            },
            tool_config_dir: "/config/esphome".to_string(),
            tool_build_root: "/data/build".to_string(),
            builds_dir: Dir::new("/config/esphome/builds"),
            engine_sockets: vec![PathBuf::from("/run/docker.sock"), PathBuf::from("/var/run/docker.sock")],
            compile_timeout: Duration::from_secs(900),
            upload_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// A firmware image ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path on this host
    pub host_path: PathBuf,

    /// Path as seen by the build tool
    pub tool_path: String,
}

/// Drives `esphome` for version, compile, artifact lookup and upload
pub struct Toolchain {
    runner: Arc<dyn CommandRunner>,
    options: ToolchainOptions,
}

impl Toolchain {
    pub fn new(runner: Arc<dyn CommandRunner>, options: ToolchainOptions) -> Self {
        Self { runner, options }
    }

    /// Configuration file path as seen by the build tool
    pub fn tool_config_path(&self, config_file: &str) -> String {
        format!("{}/{}", self.options.tool_config_dir.trim_end_matches('/'), config_file)
    }

    /// Wrap a command so it runs inside the execution context
    fn in_context(&self, program: &str, args: &[&str]) -> ToolCommand {
        match &self.options.context {
            ExecutionContext::Container { name } => ToolCommand::new("docker")
                .args(["exec", name.as_str(), program])
                .args(args.iter().copied()),
            ExecutionContext::Host => ToolCommand::new(program).args(args.iter().copied()),
        }
    }

    async fn probe(&self, command: ToolCommand) -> Result<ToolOutput, String> {
        match self.runner.run(&command, self.options.probe_timeout).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => Err(format!(
                "`{}` exited with {}: {}",
                command,
                output.exit_code,
                output.tail(5).join(" | ")
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Check that the execution context is usable before anything else runs
    pub async fn verify_environment(&self) -> Result<(), UpdaterError> {
        info!("Verifying execution context: {}", self.options.context.describe());

        match &self.options.context {
            ExecutionContext::Container { name } => {
                if !self.options.engine_sockets.is_empty() {
                    let mut found = None;
                    for socket in &self.options.engine_sockets {
                        if tokio::fs::metadata(socket).await.is_ok() {
                            found = Some(socket);
                            break;
                        }
                    }
                    match found {
                        Some(socket) => debug!("Container engine socket: {}", socket.display()),
                        None => {
                            return Err(UpdaterError::EnvironmentError(format!(
                                "No container engine socket found (checked {})",
                                self.options
                                    .engine_sockets
                                    .iter()
                                    .map(|p| p.display().to_string())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            )));
                        }
                    }
                }

                let version = self
                    .probe(ToolCommand::new("docker").arg("--version"))
                    .await
                    .map_err(|e| UpdaterError::EnvironmentError(format!("Container CLI unavailable: {}", e)))?;
                debug!("{}", version.output.trim());

                self.probe(ToolCommand::new("docker").arg("ps"))
                    .await
                    .map_err(|e| UpdaterError::EnvironmentError(format!("Container engine unreachable: {}", e)))?;

                self.probe(ToolCommand::new("docker").args(["inspect", name.as_str()]))
                    .await
                    .map_err(|e| {
                        UpdaterError::EnvironmentError(format!("Build container '{}' not available: {}", name, e))
                    })?;
            }
            ExecutionContext::Host => {
                self.probe(ToolCommand::new("esphome").arg("version"))
                    .await
                    .map_err(|e| UpdaterError::EnvironmentError(format!("esphome not runnable: {}", e)))?;
            }
        }

        info!("Execution context OK");
        Ok(())
    }

    /// Version the build tool would compile, or [`UNKNOWN_VERSION`]
    pub async fn current_version(&self) -> String {
        match self.probe(self.in_context("esphome", &["version"])).await {
            Ok(output) => match parse_version(&output.output) {
                Some(version) => version,
                None => {
                    warn!("Could not parse esphome version from: {}", output.output.trim());
                    UNKNOWN_VERSION.to_string()
                }
            },
            Err(e) => {
                warn!("Could not query esphome version: {}", e);
                UNKNOWN_VERSION.to_string()
            }
        }
    }

    /// Run the build for one configuration file
    pub async fn compile(&self, config_file: &str) -> Result<ToolOutput, ToolError> {
        let path = self.tool_config_path(config_file);
        let command = self.in_context("esphome", &["compile", &path]);
        self.runner.run(&command, self.options.compile_timeout).await
    }

    /// Find the firmware the last build produced and copy it into the builds directory.
    ///
    /// `names` are tried in order (configuration stem, then node name); the
    /// PlatformIO layout is probed before the legacy `.esphome/build` layout.
    pub async fn locate_artifact(&self, names: &[&str]) -> Result<Option<Artifact>, UpdaterError> {
        let mut candidates = Vec::new();
        for name in names {
            if let Some(found) = self.probe_pio_build(name).await {
                candidates.push(found);
            }
        }
        for name in names {
            candidates.push(format!(
                "{}/.esphome/build/{}/{}.bin",
                self.options.tool_config_dir.trim_end_matches('/'),
                name,
                name
            ));
        }

        let Some(stem) = names.first() else {
            return Ok(None);
        };
        self.options.builds_dir.create().await?;
        let target = self.options.builds_dir.file(&format!("{}.bin", stem));

        for source in candidates {
            debug!("Trying artifact candidate {}", source);
            if self.copy_out(&source, target.path()).await {
                info!("Artifact located: {} -> {}", source, target.path().display());
                return Ok(Some(self.artifact_for(target.path(), stem)));
            }
        }
        Ok(None)
    }

    /// Previously built firmware, from the builds directory or the build tree
    pub async fn existing_artifact(&self, names: &[&str]) -> Result<Option<Artifact>, UpdaterError> {
        if let Some(stem) = names.first() {
            let file = self.options.builds_dir.file(&format!("{}.bin", stem));
            if file.exists().await {
                debug!("Using existing artifact {}", file.path().display());
                return Ok(Some(self.artifact_for(file.path(), stem)));
            }
        }
        self.locate_artifact(names).await
    }

    /// Deliver an artifact to one network target
    pub async fn upload(&self, config_file: &str, artifact: &Artifact, target: &str) -> Result<ToolOutput, ToolError> {
        let path = self.tool_config_path(config_file);
        let command = self.in_context(
            "esphome",
            &["upload", &path, "--device", target, "--file", &artifact.tool_path],
        );
        self.runner.run(&command, self.options.upload_timeout).await
    }

    fn artifact_for(&self, host_path: &Path, stem: &str) -> Artifact {
        let tool_path = match &self.options.context {
            ExecutionContext::Container { .. } => {
                format!("{}/builds/{}.bin", self.options.tool_config_dir.trim_end_matches('/'), stem)
            }
            ExecutionContext::Host => host_path.display().to_string(),
        };
        Artifact {
            host_path: host_path.to_path_buf(),
            tool_path,
        }
    }

    async fn probe_pio_build(&self, name: &str) -> Option<String> {
        let root = self.options.tool_build_root.trim_end_matches('/');
        let output = self
            .probe(self.in_context("sh", &["-c", PIO_PROBE_SCRIPT, "sh", root, name]))
            .await
            .ok()?;
        output
            .output
            .lines()
            .map(str::trim)
            .find(|line| line.ends_with("firmware.bin"))
            .map(str::to_string)
    }

    async fn copy_out(&self, source: &str, target: &Path) -> bool {
        let target = target.display().to_string();
        let command = match &self.options.context {
            ExecutionContext::Container { name } => {
                let from = format!("{}:{}", name, source);
                ToolCommand::new("docker").args(["cp", from.as_str(), target.as_str()])
            }
            ExecutionContext::Host => ToolCommand::new("cp").args([source, target.as_str()]),
        };
        self.probe(command).await.is_ok()
    }
}

/// Extract the version from `esphome version` output
pub fn parse_version(output: &str) -> Option<String> {
    VERSION_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether an upload invocation delivered the firmware
pub fn upload_succeeded(output: &ToolOutput) -> bool {
    output.success() || UPLOAD_SUCCESS_MARKERS.iter().any(|m| output.output.contains(m))
}
