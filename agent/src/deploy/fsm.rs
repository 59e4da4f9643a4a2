//! Finite state machine for a deployment's lifecycle

use crate::errors::AgentError;
use crate::models::deployment::DeploymentStatus;

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Worker picked the deployment up (init, imports, plan)
    Begin,

    /// Plan succeeded; crossing the apply boundary
    StartApply,

    /// Apply finished, with or without changes
    Succeeded,

    /// Nothing is live: init, plan or apply failed cleanly
    Failed(String),

    /// Apply stopped with live resources
    PartiallyFailed(String),

    /// Caller cancelled before the apply boundary
    Cancel,
}

/// Deployment FSM. Terminal states are sticky.
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::from_status(DeploymentStatus::Pending)
    }

    /// Resume from a persisted status
    pub fn from_status(state: DeploymentStatus) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, AgentError> {
        use DeploymentStatus::*;

        let new_state = match (self.state, &event) {
            // Planning again after a restart re-runs init and plan
            (Pending | Planning, DeploymentEvent::Begin) => Planning,
            (Planning, DeploymentEvent::StartApply) => Applying,
            (Applying, DeploymentEvent::Succeeded) => Completed,
            (Pending | Planning | Applying, DeploymentEvent::Failed(err)) => {
                self.error = Some(err.clone());
                Failed
            }
            (Applying, DeploymentEvent::PartiallyFailed(err)) => {
                self.error = Some(err.clone());
                PartiallyFailed
            }
            (Pending | Planning, DeploymentEvent::Cancel) => {
                self.error = Some("cancelled before apply".to_string());
                Failed
            }
            (state, event) => {
                return Err(AgentError::InvalidTransition(format!(
                    "{} -> {:?}",
                    state.as_str(),
                    event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.state, DeploymentStatus::Pending | DeploymentStatus::Planning)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
