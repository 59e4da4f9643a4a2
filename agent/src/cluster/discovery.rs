//! Cluster discovery: which deployment produced the cluster a user names

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::cache::ConnectionCache;
use crate::cluster::connector::ClusterConnector;
use crate::cluster::credentials::{extract_credentials, StoredCredentials};
use crate::deploy::state::StateSnapshot;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::cluster::{ClusterConnection, ClusterIdentity};
use crate::models::deployment::{ClusterSummary, DeploymentRecord, DeploymentStatus};
use crate::registry::{DirectoryRegistry, RECORD_FILE};

/// Resource types that produce a cluster
pub const CLUSTER_RESOURCE_TYPES: &[&str] = &[
    "azurerm_kubernetes_cluster",
    "google_container_cluster",
    "aws_eks_cluster",
    "digitalocean_kubernetes_cluster",
];

/// A cluster-producing deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCandidate {
    pub identity: ClusterIdentity,
    pub working_directory: PathBuf,
    pub summary: ClusterSummary,
}

/// First cluster resource in a deployment's state
pub fn cluster_in_state(state: &StateSnapshot) -> Option<ClusterSummary> {
    state
        .entries()
        .into_iter()
        .find(|e| CLUSTER_RESOURCE_TYPES.contains(&e.resource_type))
        .map(|e| {
            let fallback = e
                .address
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string();
            ClusterSummary {
                name: e
                    .attributes
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or(fallback),
                resource_type: e.resource_type.to_string(),
                address: e.address.clone(),
            }
        })
}

pub struct ClusterDiscoveryService {
    registry: Arc<DirectoryRegistry>,
    connector: Arc<dyn ClusterConnector>,
    cache: ConnectionCache,
    rebuild_locks: Mutex<HashMap<ClusterIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClusterDiscoveryService {
    pub fn new(
        registry: Arc<DirectoryRegistry>,
        connector: Arc<dyn ClusterConnector>,
        cache: ConnectionCache,
    ) -> Self {
        Self {
            registry,
            connector,
            cache,
            rebuild_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    /// Register a completed deployment: find its cluster resource and persist
    /// credentials from the apply outputs. `None` when it produced no cluster.
    pub async fn register(
        &self,
        record: &DeploymentRecord,
        outputs: Option<&Value>,
    ) -> Result<Option<ClusterSummary>, AgentError> {
        let Some(state) = StateSnapshot::load(&record.working_directory).await? else {
            return Ok(None);
        };
        let Some(summary) = cluster_in_state(&state) else {
            return Ok(None);
        };

        match outputs.and_then(extract_credentials) {
            Some(credentials) => {
                credentials
                    .store_once(&Dir::new(&record.working_directory))
                    .await?;
            }
            None => warn!(
                "Deployment {} produced cluster {} without credential outputs",
                record.id, summary.name
            ),
        }

        // A re-apply may have replaced the cluster behind a cached connection
        self.cache.remove_deployment(&record.id);
        info!(
            "Registered cluster {} from deployment {}",
            summary.name, record.id
        );
        Ok(Some(summary))
    }

    /// Every cluster-producing deployment known to the registry
    pub async fn candidates(&self) -> Result<Vec<ClusterCandidate>, AgentError> {
        let mut candidates = Vec::new();
        for entry in self.registry.list().await? {
            let record: Option<DeploymentRecord> =
                match File::new(entry.path.join(RECORD_FILE)).read_json_opt().await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping {}: {}", entry.path.display(), e);
                        continue;
                    }
                };
            if let Some(record) = &record {
                if record.status != DeploymentStatus::Completed {
                    continue;
                }
            }

            let summary = match record.and_then(|r| r.cluster) {
                Some(summary) => Some(summary),
                None => match StateSnapshot::load(&entry.path).await {
                    Ok(state) => state.as_ref().and_then(cluster_in_state),
                    Err(e) => {
                        warn!("Skipping state of {}: {}", entry.path.display(), e);
                        None
                    }
                },
            };
            if let Some(summary) = summary {
                candidates.push(ClusterCandidate {
                    identity: ClusterIdentity::new(&entry.deployment_id, &summary.name),
                    working_directory: entry.path,
                    summary,
                });
            }
        }
        Ok(candidates)
    }

    /// Pick the cluster a hint refers to and connect to it
    pub async fn resolve(&self, hint: Option<&str>) -> Result<ClusterConnection, AgentError> {
        let candidate = self.locate(hint).await?;
        self.get_or_connect(&candidate.identity).await
    }

    /// Pick the cluster a hint refers to.
    ///
    /// Tiers are tried in order (exact name, case-insensitive substring, state
    /// content scan); the first tier with any hit decides. Two or more hits in
    /// that tier is ambiguous.
    pub async fn locate(&self, hint: Option<&str>) -> Result<ClusterCandidate, AgentError> {
        let candidates = self.candidates().await?;
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());

        let Some(hint) = hint else {
            return match candidates.len() {
                0 => Err(AgentError::ClusterNotFound(
                    "no deployment has produced a cluster".to_string(),
                )),
                1 => Ok(candidates.into_iter().next().ok_or_else(|| {
                    AgentError::Internal("candidate list changed".to_string())
                })?),
                _ => Err(AgentError::AmbiguousCluster {
                    hint: None,
                    candidates: names(&candidates),
                }),
            };
        };

        let exact: Vec<&ClusterCandidate> = candidates
            .iter()
            .filter(|c| c.identity.name == hint)
            .collect();
        if let Some(found) = decide(hint, exact)? {
            return Ok(found);
        }

        let needle = hint.to_lowercase();
        let substring: Vec<&ClusterCandidate> = candidates
            .iter()
            .filter(|c| c.identity.name.to_lowercase().contains(&needle))
            .collect();
        if let Some(found) = decide(hint, substring)? {
            return Ok(found);
        }

        let mut scanned = Vec::new();
        for candidate in &candidates {
            if self.state_mentions(candidate, &needle).await {
                scanned.push(candidate);
            }
        }
        if let Some(found) = decide(hint, scanned)? {
            return Ok(found);
        }

        Err(AgentError::ClusterNotFound(format!(
            "no cluster matches '{}' (known: {})",
            hint,
            names(&candidates).join(", ")
        )))
    }

    async fn state_mentions(&self, candidate: &ClusterCandidate, needle: &str) -> bool {
        let state = match StateSnapshot::load(&candidate.working_directory).await {
            Ok(Some(state)) => state,
            _ => return false,
        };
        state
            .entries()
            .iter()
            .filter(|e| CLUSTER_RESOURCE_TYPES.contains(&e.resource_type))
            .any(|e| e.attributes.to_string().to_lowercase().contains(needle))
    }

    /// Cached connection when fresh, otherwise rebuilt from the persisted
    /// credentials. Concurrent rebuilds of one identity collapse into one.
    pub async fn get_or_connect(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<ClusterConnection, AgentError> {
        if let Some(connection) = self.cache.get_fresh(identity, Utc::now()) {
            return Ok(connection);
        }

        let lock = self.rebuild_lock(identity);
        let rebuilt = {
            let _guard = lock.lock().await;
            match self.cache.get_fresh(identity, Utc::now()) {
                Some(connection) => {
                    debug!("Connection to {} rebuilt by another caller", identity);
                    Ok(connection)
                }
                None => self.rebuild(identity).await,
            }
        };
        drop(lock);
        self.release_idle_lock(identity);
        rebuilt
    }

    async fn rebuild(&self, identity: &ClusterIdentity) -> Result<ClusterConnection, AgentError> {
        let dir = self
            .registry
            .find(&identity.deployment_id)
            .await?
            .ok_or_else(|| AgentError::ClusterNotFound(identity.to_string()))?;
        let credentials = StoredCredentials::load(&Dir::new(&dir))
            .await?
            .ok_or_else(|| {
                AgentError::ClusterError(format!("no persisted credentials for {}", identity))
            })?
            .into_bundle();
        if credentials.is_expired(Utc::now()) {
            return Err(AgentError::ClusterError(format!(
                "credentials for {} have expired",
                identity
            )));
        }

        self.connector.health_check(identity, &credentials).await?;
        let connection = ClusterConnection {
            identity: identity.clone(),
            credentials: Arc::new(credentials),
            last_health_check_at: Utc::now(),
            source_deployment_id: identity.deployment_id.clone(),
        };
        self.cache.insert(connection.clone());
        info!("Connected to {}", identity);
        Ok(connection)
    }

    /// Force a rebuild on next access
    pub fn invalidate(&self, identity: &ClusterIdentity) -> bool {
        self.release_idle_lock(identity);
        self.cache.remove(identity).is_some()
    }

    /// Drop cached connections and rebuild locks of a destroyed deployment
    pub fn forget_deployment(&self, deployment_id: &str) {
        self.cache.remove_deployment(deployment_id);
        let mut locks = self.rebuild_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|identity, _| identity.deployment_id != deployment_id);
    }

    /// Re-check every cached connection; failures are invalidated.
    /// Returns (healthy, invalidated).
    pub async fn check_cached(&self) -> (usize, usize) {
        let connections = self.cache.snapshot();
        let results = join_all(connections.iter().map(|connection| {
            self.connector
                .health_check(&connection.identity, &connection.credentials)
        }))
        .await;

        let mut healthy = 0;
        let mut invalidated = 0;
        for (connection, result) in connections.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.cache.touch(&connection.identity, Utc::now());
                    healthy += 1;
                }
                Err(e) => {
                    warn!("Health check of {} failed: {}", connection.identity, e);
                    self.cache.remove(&connection.identity);
                    invalidated += 1;
                }
            }
        }
        (healthy, invalidated)
    }

    /// Remove the rebuild lock unless a rebuild is holding or waiting on it
    fn release_idle_lock(&self, identity: &ClusterIdentity) {
        let mut locks = self.rebuild_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(identity);
        }
    }

    fn rebuild_lock(&self, identity: &ClusterIdentity) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.rebuild_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn names(candidates: &[ClusterCandidate]) -> Vec<String> {
    candidates.iter().map(|c| c.identity.to_string()).collect()
}

fn decide(
    hint: &str,
    hits: Vec<&ClusterCandidate>,
) -> Result<Option<ClusterCandidate>, AgentError> {
    match hits.len() {
        0 => Ok(None),
        1 => Ok(hits.into_iter().next().cloned()),
        _ => Err(AgentError::AmbiguousCluster {
            hint: Some(hint.to_string()),
            candidates: hits.iter().map(|c| c.identity.to_string()).collect(),
        }),
    }
}
