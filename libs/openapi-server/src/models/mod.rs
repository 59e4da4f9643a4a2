//! Agent API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body. Identifiers needed to retry, inspect or destroy later are
/// always included when the failure concerns a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

/// Start a collection session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub template_id: String,
}

/// A collection session. Secret values are redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub template_id: String,
    pub state: String,
    pub question: Option<String>,
    pub pending: Vec<String>,
    pub collected: Map<String, Value>,
}

/// One answer to the current question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    pub answer: String,
}

/// What happened to an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    /// `next_question`, `retry` or `complete`
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected: Option<Map<String, Value>>,
}

/// A free-form message to mine for parameter values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeformRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedValue {
    pub parameter: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeformResponse {
    pub extracted: usize,
    pub rejected: Vec<RejectedValue>,
    pub next: AnswerResponse,
}

/// A started (or reused) deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub deployment_id: String,
    pub status_url: String,
}

/// Status poll query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    /// Only output after this cursor
    pub since: Option<u64>,
}

/// Deployment status poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub deployment_id: String,
    pub status: String,
    pub phase: String,
    pub message: Option<String>,
    pub output_tail: Vec<String>,
    pub cursor: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_created: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untracked_resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_classification: Option<String>,
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    pub attempt: u32,
    pub keep_polling: bool,
}

/// Acknowledgement of a background operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub deployment_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Bind an existing resource into a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub address: String,
    pub external_id: String,
}

/// Resources of a partially applied deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlanResponse {
    pub deployment_id: String,
    pub working_directory: String,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub extras: Vec<String>,
    pub steps: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// What recovery did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResponse {
    /// `retried`, `import_retried`, `manual_cleanup` or `manual_intervention`
    pub action: String,
    pub deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<RecoveryPlanResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// Cluster lookup query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveQuery {
    pub name: Option<String>,
}

/// A live cluster connection. Credentials are never returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub deployment_id: String,
    pub name: String,
    pub host: String,
    pub last_health_check_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub deployment_id: String,
    pub name: String,
    pub invalidated: bool,
}
