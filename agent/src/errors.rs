//! Error types for the provisioning agent

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the provisioning agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Bad collection input; the caller re-prompts.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Malformed template or missing inputs, surfaced verbatim.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Execution error in deployment {deployment_id}: {message}")]
    ExecutionError {
        deployment_id: String,
        message: String,
        retryable: bool,
    },

    #[error(
        "Partial failure in deployment {deployment_id} ({}): {} resources are live",
        working_directory.display(),
        resources.len()
    )]
    PartialFailure {
        deployment_id: String,
        working_directory: PathBuf,
        resources: Vec<String>,
    },

    #[error("Ambiguous cluster{}: candidates {candidates:?}", hint.as_ref().map(|h| format!(" '{h}'")).unwrap_or_default())]
    AmbiguousCluster {
        hint: Option<String>,
        candidates: Vec<String>,
    },

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already complete: {0}")]
    SessionComplete(String),

    #[error("Session cancelled: {0}")]
    SessionCancelled(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Deployment busy: {0}")]
    DeploymentBusy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cluster connection error: {0}")]
    ClusterError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error buckets exposed to callers of the command surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Configuration,
    Execution,
    PartialFailure,
    Discovery,
    NotFound,
    Conflict,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Execution => "execution",
            ErrorCategory::PartialFailure => "partial_failure",
            ErrorCategory::Discovery => "discovery",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::ValidationError(_) => ErrorCategory::Validation,
            AgentError::ConfigError(_) => ErrorCategory::Configuration,
            AgentError::ExecutionError { .. } | AgentError::Cancelled(_) => {
                ErrorCategory::Execution
            }
            AgentError::PartialFailure { .. } => ErrorCategory::PartialFailure,
            AgentError::AmbiguousCluster { .. }
            | AgentError::ClusterNotFound(_)
            | AgentError::ClusterError(_) => ErrorCategory::Discovery,
            AgentError::SessionNotFound(_) | AgentError::NotFound(_) => ErrorCategory::NotFound,
            AgentError::SessionComplete(_)
            | AgentError::SessionCancelled(_)
            | AgentError::InvalidTransition(_)
            | AgentError::DeploymentBusy(_) => ErrorCategory::Conflict,
            AgentError::IoError(_)
            | AgentError::JsonError(_)
            | AgentError::HttpError(_)
            | AgentError::StorageError(_)
            | AgentError::ServerError(_)
            | AgentError::ShutdownError(_)
            | AgentError::Internal(_) => ErrorCategory::Fatal,
        }
    }

    /// Deployment id carried by the error, if any
    pub fn deployment_id(&self) -> Option<&str> {
        match self {
            AgentError::ExecutionError { deployment_id, .. }
            | AgentError::PartialFailure { deployment_id, .. } => Some(deployment_id),
            _ => None,
        }
    }
}
