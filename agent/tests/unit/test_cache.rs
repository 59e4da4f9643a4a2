//! Connection cache unit tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use infragent::cluster::cache::ConnectionCache;
use infragent::models::cluster::{ClusterConnection, ClusterIdentity, CredentialBundle};

fn connection(deployment_id: &str, name: &str, checked_secs_ago: i64) -> ClusterConnection {
    ClusterConnection {
        identity: ClusterIdentity::new(deployment_id, name),
        credentials: Arc::new(CredentialBundle {
            host: format!("https://{}.example.test", name),
            cluster_ca_certificate: None,
            client_certificate: None,
            client_key: None,
            token: None,
            kubeconfig: None,
            issued_at: Utc::now(),
            expires_at: None,
        }),
        last_health_check_at: Utc::now() - chrono::Duration::seconds(checked_secs_ago),
        source_deployment_id: deployment_id.to_string(),
    }
}

#[test]
fn test_cache_insert_and_get() {
    let cache = ConnectionCache::new(4, Duration::from_secs(300));
    cache.insert(connection("dep-1", "aks-prod", 0));

    let identity = ClusterIdentity::new("dep-1", "aks-prod");
    let entry = cache.get(&identity).unwrap();
    assert_eq!(entry.credentials.host, "https://aks-prod.example.test");
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_cache_one_entry_per_identity() {
    let cache = ConnectionCache::new(4, Duration::from_secs(300));
    cache.insert(connection("dep-1", "aks-prod", 100));
    cache.insert(connection("dep-1", "aks-prod", 0));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_cache_freshness_window() {
    let cache = ConnectionCache::new(4, Duration::from_secs(60));
    cache.insert(connection("dep-1", "fresh", 10));
    cache.insert(connection("dep-2", "stale", 120));

    let now = Utc::now();
    assert!(cache
        .get_fresh(&ClusterIdentity::new("dep-1", "fresh"), now)
        .is_some());
    assert!(cache
        .get_fresh(&ClusterIdentity::new("dep-2", "stale"), now)
        .is_none());
    // Stale entries stay cached until rebuilt or invalidated
    assert!(cache.get(&ClusterIdentity::new("dep-2", "stale")).is_some());

    assert!(cache.touch(&ClusterIdentity::new("dep-2", "stale"), now));
    assert!(cache
        .get_fresh(&ClusterIdentity::new("dep-2", "stale"), now)
        .is_some());
}

#[test]
fn test_cache_expired_credentials_are_never_fresh() {
    let cache = ConnectionCache::new(4, Duration::from_secs(300));
    let mut expired = connection("dep-1", "aks", 0);
    expired.credentials = Arc::new(CredentialBundle {
        host: "https://aks.example.test".to_string(),
        cluster_ca_certificate: None,
        client_certificate: None,
        client_key: None,
        token: None,
        kubeconfig: None,
        issued_at: Utc::now() - chrono::Duration::hours(2),
        expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
    });
    cache.insert(expired);
    assert!(cache
        .get_fresh(&ClusterIdentity::new("dep-1", "aks"), Utc::now())
        .is_none());
}

#[test]
fn test_cache_eviction_drops_stalest() {
    let cache = ConnectionCache::new(2, Duration::from_secs(300));
    cache.insert(connection("dep-1", "a", 50));
    cache.insert(connection("dep-2", "b", 10));
    cache.insert(connection("dep-3", "c", 0));

    assert_eq!(cache.len(), 2);
    assert!(cache.get(&ClusterIdentity::new("dep-1", "a")).is_none());
    assert!(cache.get(&ClusterIdentity::new("dep-3", "c")).is_some());
}

#[test]
fn test_cache_remove_deployment() {
    let cache = ConnectionCache::new(4, Duration::from_secs(300));
    cache.insert(connection("dep-1", "a", 0));
    cache.insert(connection("dep-1", "b", 0));
    cache.insert(connection("dep-2", "c", 0));

    assert_eq!(cache.remove_deployment("dep-1"), 2);
    assert_eq!(cache.len(), 1);
    assert!(cache.remove(&ClusterIdentity::new("dep-2", "c")).is_some());
    assert!(cache.is_empty());
}
