//! Failure classification models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::parameter::RecordedParameter;

/// Why an execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NamingConflict,
    CapacityConstraint,
    QuotaExceeded,
    PartialApply,
    Unknown,
}

impl FailureKind {
    /// Whether a retry with adjusted parameters can help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::NamingConflict | FailureKind::CapacityConstraint | FailureKind::QuotaExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NamingConflict => "naming_conflict",
            FailureKind::CapacityConstraint => "capacity_constraint",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::PartialApply => "partial_apply",
            FailureKind::Unknown => "unknown",
        }
    }
}

/// One failed attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub deployment_id: String,
    pub template_id: String,
    pub attempted_parameters: Vec<RecordedParameter>,
    /// Digest of template id and the full (unredacted) parameter values
    pub fingerprint: String,
    pub kind: FailureKind,
    pub failure_reason: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Recorded value of one parameter in this attempt
    pub fn value_of(&self, name: &str) -> Option<&serde_json::Value> {
        self.attempted_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// A cloud resource to bind into the tool's state before planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportHint {
    pub address: String,
    pub external_id: String,
}
