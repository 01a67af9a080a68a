//! Logging configuration
//!
//! Two sinks are installed. The operator-facing stdout sink is gated by the
//! configured [`LogLevel`]; the persistent log file receives every event at
//! every level so a quiet run can be reconstructed afterwards.

use std::path::PathBuf;

use tracing::{Level, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::{filter_fn, LevelFilter},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

use crate::errors::UpdaterError;

/// Target for events that must reach the operator at every level
/// (run headers, per-device verdicts, the final summary).
pub const SUMMARY: &str = "summary";

/// Operator-facing verbosity, ordered from quietest to loudest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Summary,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Summary => "summary",
            LogLevel::Normal => "normal",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
        }
    }

    /// Severity of an event, derived from its target and level.
    ///
    /// `summary`-targeted events and every `WARN`/`ERROR` are summary; the
    /// remaining tracing levels map one-to-one onto the louder severities.
    pub fn of(level: &Level, target: &str) -> LogLevel {
        if target == SUMMARY {
            return LogLevel::Summary;
        }
        match *level {
            Level::ERROR | Level::WARN => LogLevel::Summary,
            Level::INFO => LogLevel::Normal,
            Level::DEBUG => LogLevel::Verbose,
            Level::TRACE => LogLevel::Debug,
        }
    }

    /// Whether an event of `severity` reaches the operator sink at this level
    pub fn admits(&self, severity: LogLevel) -> bool {
        severity <= *self
    }

    fn admits_metadata(&self, metadata: &Metadata<'_>) -> bool {
        self.admits(LogLevel::of(metadata.level(), metadata.target()))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "summary" => Ok(LogLevel::Summary),
            "normal" | "info" => Ok(LogLevel::Normal),
            "verbose" => Ok(LogLevel::Verbose),
            "debug" | "trace" => Ok(LogLevel::Debug),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl serde::Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Operator-facing level
    pub log_level: LogLevel,

    /// Write gated logs to stdout
    pub stdout: bool,

    /// Persistent log file, always written at full detail
    pub log_file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Normal,
            stdout: true,
            log_file: Some(PathBuf::from("/config/esphome_smart_update.log")),
        }
    }
}

/// Initialize logging.
///
/// The returned guard flushes the persistent log when dropped and must be
/// kept alive for the whole run.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, UpdaterError> {
    let level = options.log_level;

    let stdout_layer = options.stdout.then(|| {
        fmt::layer()
            .with_target(false)
            .with_filter(filter_fn(move |metadata| level.admits_metadata(metadata)))
    });

    let (file_layer, guard) = match &options.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| UpdaterError::LoggingError(format!("Invalid log file path: {}", path.display())))?;
            std::fs::create_dir_all(&directory)?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::TRACE);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| UpdaterError::LoggingError(e.to_string()))?;

    Ok(guard)
}
