//! External tool invocation.
//!
//! [`CommandRunner`] is the single seam through which the updater touches
//! the outside world: every compile, copy, probe and upload is a command
//! with a timeout. [`ProcessRunner`] spawns real processes; tests substitute
//! a scripted runner.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::errors::ToolError;
use crate::shutdown::Shutdown;

/// Maximum bytes captured per output stream
const MAX_OUTPUT_BYTES: u64 = 4 * 1024 * 1024;

/// A program with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Process exit code (`-1` if killed by a signal)
    pub exit_code: i32,

    /// Stdout followed by stderr
    pub output: String,

    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `n` lines of output, for diagnostics
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].to_vec()
    }
}

/// Capability to run external commands with a bounded timeout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand, timeout: Duration) -> Result<ToolOutput, ToolError>;
}

/// Runs commands as child processes.
///
/// The child is killed when the timeout expires or shutdown is requested,
/// so nothing is left orphaned.
pub struct ProcessRunner {
    shutdown: Shutdown,
}

impl ProcessRunner {
    pub fn new(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand, timeout: Duration) -> Result<ToolOutput, ToolError> {
        let program = command.program.clone();
        if self.shutdown.is_requested() {
            return Err(ToolError::Cancelled { program });
        }

        debug!("Running: {}", command);
        let start = Instant::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr).await });

        let waited = tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(result) => Waited::Exited(result),
                Err(_) => Waited::TimedOut,
            },
            _ = self.shutdown.requested() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(Ok(status)) => status,
            Waited::Exited(Err(source)) => return Err(ToolError::Io { program, source }),
            Waited::TimedOut => {
                let _ = child.kill().await;
                return Err(ToolError::Timeout {
                    program,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
            Waited::Cancelled => {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled { program });
            }
        };

        let mut output = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = stderr_task.await.unwrap_or_default();
        if !stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&stderr));
        }

        let result = ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            output,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        trace!("{} exited with {} after {}ms", command.program, result.exit_code, result.duration_ms);
        Ok(result)
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}
