//! Error types for jobctl
//!
//! Centralized error handling using thiserror.

use std::path::PathBuf;

use thiserror::Error;

/// All error types that can occur while managing the job folder
#[derive(Debug, Error)]
pub enum JobControlError {
    /// Working directory given at stage time does not exist
    #[error("Invalid working directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    /// Eta is not a non-negative number of seconds
    #[error("Invalid eta: {0} (eta must be a non-negative number of seconds)")]
    InvalidEta(String),

    /// Retire was called on a task that has no `.finish` sentinel
    #[error("Task not finished: {0}")]
    TaskNotFinished(String),

    /// Task file is missing from the expected area
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task file exists but does not carry the two header lines
    #[error("Malformed task file {}: {reason}", path.display())]
    MalformedTask { path: PathBuf, reason: String },

    /// External scheduler command failed beyond the retry bound
    #[error("Scheduler error ({backend}): {message}")]
    Scheduler { backend: String, message: String },

    /// Configured backend name is not one of the known variants
    #[error("Unknown backend: {0} (expected local, bwuni or heidelberg)")]
    UnknownBackend(String),

    /// Configuration lookup or update failed
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl JobControlError {
    /// Build a scheduler error for the named backend
    pub fn scheduler(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scheduler {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for jobctl operations
pub type Result<T> = std::result::Result<T, JobControlError>;
