//! Error types for the selective updater

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the selective updater
#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The execution context or a required tool is unusable. Fatal to the run.
    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("Journal error: {0}")]
    JournalError(String),

    #[error("Metadata error: {0}")]
    MetadataError(String),

    #[error("Tool error: {0}")]
    ToolError(#[from] ToolError),

    #[error("Invalid transition: {0}")]
    TransitionError(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Logging error: {0}")]
    LoggingError(String),
}

/// Failure of one external tool invocation
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {elapsed_ms}ms")]
    Timeout { program: String, elapsed_ms: u64 },

    #[error("`{program}` cancelled by shutdown")]
    Cancelled { program: String },

    #[error("IO error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }
}

/// Why a device ended up in the journal's `failed` set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    CompileFailed,
    CompileTimeout,
    ArtifactMissing,
    UploadFailed,
    UploadTimeout,
    DeliveryExhausted,
    MetadataWriteFailed,
    Interrupted,
    ToolError,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::CompileFailed => "compile_failed",
            FailureClass::CompileTimeout => "compile_timeout",
            FailureClass::ArtifactMissing => "artifact_missing",
            FailureClass::UploadFailed => "upload_failed",
            FailureClass::UploadTimeout => "upload_timeout",
            FailureClass::DeliveryExhausted => "delivery_exhausted",
            FailureClass::MetadataWriteFailed => "metadata_write_failed",
            FailureClass::Interrupted => "interrupted",
            FailureClass::ToolError => "tool_error",
        }
    }

    /// Failures that count against `stop_on_compilation_error`
    pub fn is_compile_phase(&self) -> bool {
        matches!(
            self,
            FailureClass::CompileFailed | FailureClass::CompileTimeout | FailureClass::ArtifactMissing
        )
    }

    /// Failures that count against `stop_on_upload_error`
    pub fn is_upload_phase(&self) -> bool {
        matches!(
            self,
            FailureClass::UploadFailed | FailureClass::UploadTimeout | FailureClass::DeliveryExhausted
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
