//! Error types for labdeploy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application level error type
#[derive(Error, Debug)]
pub enum LabError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid output pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Packaging error: {0}")]
    PackagingError(String),

    #[error("Compilation error: {0}")]
    CompileError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LabError {
    /// Failure classification used in deployment results
    pub fn kind(&self) -> FailureKind {
        match self {
            LabError::ConfigError(_) | LabError::JsonError(_) | LabError::PatternError(_) => {
                FailureKind::Configuration
            }
            LabError::CompileError(_) => FailureKind::Compilation,
            LabError::IoError(_) | LabError::PackagingError(_) => FailureKind::Packaging,
            LabError::MqttError(_) | LabError::Internal(_) => FailureKind::CommandFailed,
        }
    }
}

/// Why a host deployment failed.
///
/// Every host-scoped error in the crate maps onto exactly one of these, so
/// operators can tell a misconfigured host from an unreachable one or from a
/// remote host that is missing its lab tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Authentication,
    Connection,
    Timeout,
    Transfer,
    Packaging,
    Extraction,
    DependencyMissing,
    AlreadyRunning,
    CommandFailed,
    Compilation,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "misconfigured",
            FailureKind::Authentication => "authentication failed",
            FailureKind::Connection => "unreachable",
            FailureKind::Timeout => "timed out",
            FailureKind::Transfer => "transfer failed",
            FailureKind::Packaging => "packaging failed",
            FailureKind::Extraction => "extraction failed",
            FailureKind::DependencyMissing => "remote tool missing",
            FailureKind::AlreadyRunning => "lab already running",
            FailureKind::CommandFailed => "remote command failed",
            FailureKind::Compilation => "compilation failed",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
