//! Per-host deployment results

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::FailureKind;

/// Outcome of deploying to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentResult {
    /// Lab reported as started on the remote host
    Succeeded,

    /// Configuration was packaged for offline use, no remote session
    Packaged { archive: PathBuf },

    /// `localhost` is deployed outside this tool
    SkippedLocal,

    /// No record for the host in the settings file
    SkippedNoConfig,

    /// Record present but without a platform tag
    SkippedNoPlatform,

    /// Platform tag outside the known set
    SkippedUnknownPlatform { platform: String },

    /// Known platform with no deployment path for this kind of host
    SkippedNoDeployer { platform: String },

    Failed { kind: FailureKind, reason: String },
}

impl DeploymentResult {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        DeploymentResult::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DeploymentResult::Failed { .. })
    }

    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            DeploymentResult::SkippedLocal
                | DeploymentResult::SkippedNoConfig
                | DeploymentResult::SkippedNoPlatform
                | DeploymentResult::SkippedUnknownPlatform { .. }
                | DeploymentResult::SkippedNoDeployer { .. }
        )
    }

    /// Short operator-facing description
    pub fn describe(&self) -> String {
        match self {
            DeploymentResult::Succeeded => "lab started".to_string(),
            DeploymentResult::Packaged { archive } => {
                format!("packaged to {}", archive.display())
            }
            DeploymentResult::SkippedLocal => "skipped: local deployment".to_string(),
            DeploymentResult::SkippedNoConfig => {
                "skipped: misconfigured (host not defined in configuration)".to_string()
            }
            DeploymentResult::SkippedNoPlatform => {
                "skipped: misconfigured (no platform defined)".to_string()
            }
            DeploymentResult::SkippedUnknownPlatform { platform } => {
                format!("skipped: misconfigured (unknown platform '{}')", platform)
            }
            DeploymentResult::SkippedNoDeployer { platform } => {
                format!("skipped: no deployment available for platform {}", platform)
            }
            DeploymentResult::Failed { kind, reason } => format!("failed: {}: {}", kind, reason),
        }
    }
}

impl fmt::Display for DeploymentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Result for one requested host
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub result: DeploymentResult,
}

/// Aggregated results of one deployment run
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// One entry per distinct requested host, in request order
    pub entries: Vec<HostReport>,
}

impl DeploymentReport {
    pub fn get(&self, host: &str) -> Option<&DeploymentResult> {
        self.entries
            .iter()
            .find(|entry| entry.host == host)
            .map(|entry| &entry.result)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostReport> {
        self.entries.iter().filter(|entry| entry.result.is_failure())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}
