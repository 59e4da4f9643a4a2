//! Mapping of agent errors onto HTTP responses

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::ErrorResponse;
use tracing::error;

use crate::errors::{AgentError, ErrorCategory};

/// An error with the deployment context a caller needs to come back later
#[derive(Debug)]
pub struct ApiError {
    pub error: AgentError,
    pub deployment_id: Option<String>,
    pub working_directory: Option<PathBuf>,
}

impl ApiError {
    pub fn with_deployment(mut self, deployment_id: &str, working_directory: Option<PathBuf>) -> Self {
        if self.deployment_id.is_none() {
            self.deployment_id = Some(deployment_id.to_string());
        }
        if self.working_directory.is_none() {
            self.working_directory = working_directory;
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        match (&self.error, self.error.category()) {
            (AgentError::ClusterNotFound(_), _) => StatusCode::NOT_FOUND,
            (AgentError::AmbiguousCluster { .. }, _) => StatusCode::CONFLICT,
            (_, ErrorCategory::Validation) => StatusCode::UNPROCESSABLE_ENTITY,
            (_, ErrorCategory::Configuration) => StatusCode::BAD_REQUEST,
            (_, ErrorCategory::Execution) => StatusCode::BAD_GATEWAY,
            (_, ErrorCategory::PartialFailure) => StatusCode::CONFLICT,
            (_, ErrorCategory::Discovery) => StatusCode::BAD_GATEWAY,
            (_, ErrorCategory::NotFound) => StatusCode::NOT_FOUND,
            (_, ErrorCategory::Conflict) => StatusCode::CONFLICT,
            (_, ErrorCategory::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        let deployment_id = error.deployment_id().map(String::from);
        let working_directory = match &error {
            AgentError::PartialFailure {
                working_directory, ..
            } => Some(working_directory.clone()),
            _ => None,
        };
        Self {
            error,
            deployment_id,
            working_directory,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.error);
        }
        let (candidates, resources) = match &self.error {
            AgentError::AmbiguousCluster { candidates, .. } => (candidates.clone(), Vec::new()),
            AgentError::PartialFailure { resources, .. } => (Vec::new(), resources.clone()),
            _ => (Vec::new(), Vec::new()),
        };
        let body = ErrorResponse {
            category: self.error.category().as_str().to_string(),
            message: self.error.to_string(),
            deployment_id: self.deployment_id,
            working_directory: self
                .working_directory
                .map(|p| p.display().to_string()),
            candidates,
            resources,
        };
        (status, Json(body)).into_response()
    }
}
