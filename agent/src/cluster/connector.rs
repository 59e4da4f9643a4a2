//! Connections to a cluster's API server

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{header, Certificate, Client, Identity};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::errors::AgentError;
use crate::models::cluster::{ClusterIdentity, CredentialBundle};

/// Health checks a cluster with its credentials
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn health_check(
        &self,
        identity: &ClusterIdentity,
        credentials: &CredentialBundle,
    ) -> Result<(), AgentError>;
}

/// `GET <host>/readyz` over rustls
#[derive(Debug, Clone)]
pub struct HttpClusterConnector {
    timeout: Duration,
}

impl HttpClusterConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, credentials: &CredentialBundle) -> Result<Client, AgentError> {
        let mut builder = Client::builder().use_rustls_tls().timeout(self.timeout);

        if let Some(ca) = &credentials.cluster_ca_certificate {
            let pem = decode_pem(ca)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&credentials.client_certificate, &credentials.client_key)
        {
            let mut pem = decode_pem(cert)?;
            pem.push(b'\n');
            pem.extend(decode_pem(key.expose_secret())?);
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        Ok(builder.build()?)
    }
}

/// Certificates arrive base64-encoded PEM, or plain PEM
fn decode_pem(value: &str) -> Result<Vec<u8>, AgentError> {
    let trimmed = value.trim();
    if trimmed.starts_with("-----BEGIN") {
        return Ok(trimmed.as_bytes().to_vec());
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map_err(|e| AgentError::ClusterError(format!("invalid base64 certificate: {}", e)))
}

#[async_trait]
impl ClusterConnector for HttpClusterConnector {
    async fn health_check(
        &self,
        identity: &ClusterIdentity,
        credentials: &CredentialBundle,
    ) -> Result<(), AgentError> {
        let base = url::Url::parse(&credentials.host).map_err(|e| {
            AgentError::ClusterError(format!("invalid API host for {}: {}", identity, e))
        })?;
        let url = base
            .join("readyz")
            .map_err(|e| AgentError::ClusterError(e.to_string()))?;
        debug!("Health check {} at {}", identity, url);

        let mut request = self.client(credentials)?.get(url);
        if let Some(token) = &credentials.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AgentError::ClusterError(format!(
                "{} is not ready: HTTP {}",
                identity,
                response.status()
            )));
        }
        Ok(())
    }
}
