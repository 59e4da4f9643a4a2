//! Cluster connection models

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Which cluster, and which deployment produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub deployment_id: String,
    pub name: String,
}

impl ClusterIdentity {
    pub fn new(deployment_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.deployment_id)
    }
}

/// Credentials emitted by the apply as a sensitive output
#[derive(Debug)]
pub struct CredentialBundle {
    /// API server URL
    pub host: String,
    /// Base64 PEM
    pub cluster_ca_certificate: Option<String>,
    /// Base64 PEM
    pub client_certificate: Option<String>,
    /// Base64 PEM
    pub client_key: Option<SecretString>,
    pub token: Option<SecretString>,
    /// Raw kubeconfig document, when the template emits one
    pub kubeconfig: Option<SecretString>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialBundle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// A live (recently health-checked) cluster connection
#[derive(Debug, Clone)]
pub struct ClusterConnection {
    pub identity: ClusterIdentity,
    pub credentials: Arc<CredentialBundle>,
    pub last_health_check_at: DateTime<Utc>,
    pub source_deployment_id: String,
}

impl ClusterConnection {
    pub fn is_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        if self.credentials.is_expired(now) {
            return false;
        }
        match chrono::Duration::from_std(window) {
            Ok(window) => now - self.last_health_check_at < window,
            Err(_) => true,
        }
    }
}
