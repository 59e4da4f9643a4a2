//! Live cluster connection cache

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::cluster::{ClusterConnection, ClusterIdentity};

/// In-memory connection cache. At most one entry per identity.
pub struct ConnectionCache {
    entries: RwLock<HashMap<ClusterIdentity, ClusterConnection>>,
    capacity: u64,
    freshness_window: Duration,
}

impl ConnectionCache {
    pub fn new(capacity: u64, freshness_window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            freshness_window,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Cached connection, fresh or not
    pub fn get(&self, identity: &ClusterIdentity) -> Option<ClusterConnection> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(identity).cloned()
    }

    /// Cached connection whose last health check is within the window
    pub fn get_fresh(
        &self,
        identity: &ClusterIdentity,
        now: DateTime<Utc>,
    ) -> Option<ClusterConnection> {
        self.get(identity)
            .filter(|c| c.is_fresh(self.freshness_window, now))
    }

    /// Insert or replace a connection
    pub fn insert(&self, connection: ClusterConnection) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // Evict the stalest entry if at capacity
        if !entries.contains_key(&connection.identity) && entries.len() as u64 >= self.capacity {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, c)| c.last_health_check_at)
                .map(|(id, _)| id.clone())
            {
                entries.remove(&stalest);
            }
        }

        entries.insert(connection.identity.clone(), connection);
    }

    /// Move an entry's health check timestamp forward
    pub fn touch(&self, identity: &ClusterIdentity, at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(identity) {
            Some(connection) => {
                connection.last_health_check_at = at;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, identity: &ClusterIdentity) -> Option<ClusterConnection> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(identity)
    }

    /// Drop every connection sourced from a deployment
    pub fn remove_deployment(&self, deployment_id: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, c| c.source_deployment_id != deployment_id);
        before - entries.len()
    }

    pub fn snapshot(&self) -> Vec<ClusterConnection> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
