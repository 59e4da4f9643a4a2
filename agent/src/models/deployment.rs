//! Deployment models

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::failure::FailureKind;
use crate::models::parameter::RecordedParameter;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Allocated, worker not yet running
    Pending,

    /// Init, imports and plan
    Planning,

    /// Apply in progress; cannot be cancelled
    Applying,

    Completed,

    Failed,

    /// Apply stopped with live resources left behind
    PartiallyFailed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::PartiallyFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Planning => "planning",
            DeploymentStatus::Applying => "applying",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::PartiallyFailed => "partially_failed",
        }
    }
}

/// Finer-grained progress than the status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queued,
    Init,
    Import,
    Plan,
    Apply,
    Destroy,
    Done,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressPhase::Queued => "queued",
            ProgressPhase::Init => "init",
            ProgressPhase::Import => "import",
            ProgressPhase::Plan => "plan",
            ProgressPhase::Apply => "apply",
            ProgressPhase::Destroy => "destroy",
            ProgressPhase::Done => "done",
        }
    }
}

/// A resource bound into the tool's state from outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedResource {
    pub address: String,
    pub external_id: String,
    pub imported_at: DateTime<Utc>,
}

/// Cluster produced by a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub name: String,
    pub resource_type: String,
    pub address: String,
}

/// Persisted state of one deployment attempt.
///
/// The output log lives next to it in the working directory (`output.log`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub working_directory: PathBuf,
    pub template_id: String,
    /// Redacted, in collection order
    pub parameters: Vec<RecordedParameter>,
    pub fingerprint: String,
    pub status: DeploymentStatus,
    pub phase: ProgressPhase,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub error_classification: Option<FailureKind>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Authoritative resource list reported by the tool
    #[serde(default)]
    pub resources: Vec<String>,
    /// Present in the tool's state but neither declared nor imported
    #[serde(default)]
    pub untracked_resources: Vec<String>,
    #[serde(default)]
    pub imported: Vec<ImportedResource>,
    #[serde(default)]
    pub cluster: Option<ClusterSummary>,
    #[serde(default)]
    pub retry_of: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Synthesized from a directory written by an older release
    #[serde(default)]
    pub legacy: bool,
}

fn default_attempt() -> u32 {
    1
}

impl DeploymentRecord {
    pub fn new(
        id: String,
        working_directory: PathBuf,
        template_id: String,
        parameters: Vec<RecordedParameter>,
        fingerprint: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            working_directory,
            template_id,
            parameters,
            fingerprint,
            status: DeploymentStatus::Pending,
            phase: ProgressPhase::Queued,
            created_at: now,
            last_transition_at: now,
            error_classification: None,
            message: None,
            errors: Vec::new(),
            resources: Vec::new(),
            untracked_resources: Vec::new(),
            imported: Vec::new(),
            cluster: None,
            retry_of: None,
            attempt: 1,
            legacy: false,
        }
    }

    /// Record for a legacy directory that has no record file
    pub fn legacy(id: String, working_directory: PathBuf, resources: Vec<String>) -> Self {
        let mut record = Self::new(
            id,
            working_directory,
            "unknown".to_string(),
            Vec::new(),
            String::new(),
        );
        record.status = if resources.is_empty() {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::Completed
        };
        record.phase = ProgressPhase::Done;
        record.resources = resources;
        record.legacy = true;
        record.message = Some("recovered from legacy storage".to_string());
        record
    }

    /// Declared-or-imported check used to keep resource lists honest
    pub fn is_imported(&self, address: &str) -> bool {
        self.imported.iter().any(|i| i.address == address)
    }
}
