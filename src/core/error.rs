use std::io;
use thiserror::Error;

use crate::core::verdict::FailCategory;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Routing error: {0}")]
    RoutingError(String),
    #[error("Artifact error: {0}")]
    ArtifactError(String),
    #[error("Version control error: {0}")]
    VcsError(String),
    #[error("Malformed diff: {0}")]
    MalformedDiff(String),
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    GlobError { pattern: String, reason: String },
}

impl GuardError {
    /// Exit classification for a run that had to stop before policy evaluation.
    pub fn abort_category(&self) -> FailCategory {
        match self {
            GuardError::ConfigError(_) | GuardError::GlobError { .. } => FailCategory::ConfigInvalid,
            GuardError::ArtifactError(_) => FailCategory::ArtifactInvalid,
            GuardError::IoError(_)
            | GuardError::JsonError(_)
            | GuardError::RoutingError(_)
            | GuardError::VcsError(_)
            | GuardError::MalformedDiff(_) => FailCategory::RoutingInvalid,
        }
    }
}
