//! Cluster credentials emitted as apply outputs

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::cluster::CredentialBundle;
use crate::registry::CREDENTIALS_FILE;

static KUBECONFIG_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(server|certificate-authority-data|client-certificate-data|client-key-data|token):\s*(\S+)\s*$",
    )
    .expect("kubeconfig regex")
});

/// Credentials as written to `cluster-credentials.json` (mode 0600)
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub host: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub cluster_ca_certificate: Option<String>,
    #[serde(default)]
    pub client_certificate: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("host", &self.host)
            .field("cluster_name", &self.cluster_name)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl StoredCredentials {
    pub fn into_bundle(self) -> CredentialBundle {
        CredentialBundle {
            host: self.host,
            cluster_ca_certificate: self.cluster_ca_certificate,
            client_certificate: self.client_certificate,
            client_key: self.client_key.map(SecretString::from),
            token: self.token.map(SecretString::from),
            kubeconfig: self.kubeconfig.map(SecretString::from),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }

    /// Write to the deployment directory unless already there
    pub async fn store_once(&self, dir: &Dir) -> Result<bool, AgentError> {
        let file = dir.file(CREDENTIALS_FILE);
        let content = serde_json::to_vec_pretty(self)?;
        let written = file.write_once(&content).await?;
        if written {
            file.set_permissions_600().await?;
            info!("Stored cluster credentials in {}", file.path().display());
        }
        Ok(written)
    }

    pub async fn load(dir: &Dir) -> Result<Option<Self>, AgentError> {
        dir.file(CREDENTIALS_FILE).read_json_opt().await
    }
}

/// Value of a named output from `output -json`
fn output_value<'a>(outputs: &'a Value, name: &str) -> Option<&'a Value> {
    let output = outputs.get(name)?;
    match output.get("value") {
        Some(value) => Some(value),
        None => Some(output),
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| value.get(*n).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn from_object(value: &Value) -> Option<StoredCredentials> {
    let value = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let host = string_field(value, &["host", "endpoint", "server"])?;
    Some(StoredCredentials {
        host,
        cluster_name: string_field(value, &["cluster_name", "name"]),
        cluster_ca_certificate: string_field(
            value,
            &["cluster_ca_certificate", "certificate_authority", "ca_certificate"],
        ),
        client_certificate: string_field(value, &["client_certificate"]),
        client_key: string_field(value, &["client_key"]),
        token: string_field(value, &["token", "password"]),
        kubeconfig: None,
        issued_at: Utc::now(),
        expires_at: None,
    })
}

fn from_kubeconfig(raw: &str) -> Option<StoredCredentials> {
    let mut fields = std::collections::HashMap::new();
    for caps in KUBECONFIG_FIELD_RE.captures_iter(raw) {
        fields
            .entry(caps[1].to_string())
            .or_insert_with(|| caps[2].trim_matches('"').to_string());
    }
    Some(StoredCredentials {
        host: fields.remove("server")?,
        cluster_name: None,
        cluster_ca_certificate: fields.remove("certificate-authority-data"),
        client_certificate: fields.remove("client-certificate-data"),
        client_key: fields.remove("client-key-data"),
        token: fields.remove("token"),
        kubeconfig: Some(raw.to_string()),
        issued_at: Utc::now(),
        expires_at: None,
    })
}

/// Credentials from apply outputs: `cluster_credentials`, then `kube_config`
/// (object or single-element list), then raw `kube_config_raw`
pub fn extract_credentials(outputs: &Value) -> Option<StoredCredentials> {
    let raw = output_value(outputs, "kube_config_raw")
        .and_then(Value::as_str)
        .map(String::from);

    let mut credentials = ["cluster_credentials", "kube_config"]
        .iter()
        .filter_map(|name| output_value(outputs, name))
        .find_map(from_object)
        .or_else(|| raw.as_deref().and_then(from_kubeconfig))?;

    if credentials.kubeconfig.is_none() {
        credentials.kubeconfig = raw;
    }
    if credentials.cluster_name.is_none() {
        credentials.cluster_name = output_value(outputs, "cluster_name")
            .and_then(Value::as_str)
            .map(String::from);
    }
    Some(credentials)
}
