//! Error types for swe-bench-harness operations.
//!
//! Defines error types for the major subsystems:
//! - Docker container sessions (image resolution, lifecycle, exec, file injection)
//! - Trial execution phases
//! - Scoring of captured test output
//! - The benchmark result store
//! - Configuration and dataset loading

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to start environment '{name}': {reason}")]
    EnvironmentStartFailed { name: String, reason: String },

    #[error("Docker exec failed: {0}")]
    ExecFailed(String),

    #[error("Failed to copy file into container: {0}")]
    CopyFailed(String),

    #[error("Container is not running (status: {status})")]
    NotRunning { status: String },

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Invalid container path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a scoring backend.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Scoring failed for '{instance_id}': {reason}")]
    Failed { instance_id: String, reason: String },

    #[error("Invalid test log pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// Errors that abort a trial.
///
/// `PatchFailed` is a validation failure (the instance is unusable); every
/// other variant is an infrastructure failure of the harness.
#[derive(Debug, Error)]
pub enum TrialError {
    #[error("Patch failed")]
    PatchFailed,

    #[error("Failed to establish initial git ref: {0}")]
    GitRef(String),

    #[error("Failed to capture diff: {0}")]
    Diff(String),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrialError {
    /// Returns true if this error marks the instance itself as unusable.
    pub fn is_validation(&self) -> bool {
        matches!(self, TrialError::PatchFailed)
    }
}

/// Errors that can occur in the benchmark coordinator and its result store.
#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("Corrupt result document {path:?}: {source}")]
    CorruptResult {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to create output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors that can occur while loading and selecting task instances.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Invalid record on line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("Instance '{0}' not found in dataset")]
    InstanceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
