//! Directory registry tests

use infragent::errors::AgentError;
use infragent::filesys::dir::Dir;
use infragent::registry::{DirectoryRegistry, STATE_FILE};

fn registry(persistent: &std::path::Path, legacy: &[&std::path::Path]) -> DirectoryRegistry {
    DirectoryRegistry::new(
        Dir::new(persistent),
        legacy.iter().map(|p| Dir::new(*p)).collect(),
    )
}

#[tokio::test]
async fn test_assign_is_idempotent() {
    let persistent = tempfile::tempdir().unwrap();
    let registry = registry(persistent.path(), &[]);

    let first = registry.assign("dep-0a1b2c3d4e5f").await.unwrap();
    std::fs::write(first.join("marker"), "keep").unwrap();
    let second = registry.assign("dep-0a1b2c3d4e5f").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, persistent.path().join("dep-0a1b2c3d4e5f"));
    // Contents are never touched
    assert_eq!(std::fs::read_to_string(second.join("marker")).unwrap(), "keep");
}

#[tokio::test]
async fn test_find_after_assign() {
    let persistent = tempfile::tempdir().unwrap();
    let registry = registry(persistent.path(), &[]);

    assert_eq!(registry.find("dep-0a1b2c3d4e5f").await.unwrap(), None);
    let dir = registry.assign("dep-0a1b2c3d4e5f").await.unwrap();
    assert_eq!(registry.find("dep-0a1b2c3d4e5f").await.unwrap(), Some(dir));
}

#[tokio::test]
async fn test_find_in_legacy_root_only() {
    let persistent = tempfile::tempdir().unwrap();
    let legacy = tempfile::tempdir().unwrap();
    std::fs::create_dir(legacy.path().join("dep-legacy01")).unwrap();

    let registry = registry(persistent.path(), &[legacy.path()]);
    let found = registry.find("dep-legacy01").await.unwrap().unwrap();
    assert_eq!(found, legacy.path().join("dep-legacy01"));
    assert!(registry.is_legacy(&found));

    // Legacy roots are never written to
    let assigned = registry.assign("dep-new0001").await.unwrap();
    assert!(assigned.starts_with(persistent.path()));
    assert!(!legacy.path().join("dep-new0001").exists());
}

#[tokio::test]
async fn test_persistent_root_wins_over_legacy() {
    let persistent = tempfile::tempdir().unwrap();
    let legacy = tempfile::tempdir().unwrap();
    std::fs::create_dir(legacy.path().join("dep-shared01")).unwrap();

    let registry = registry(persistent.path(), &[legacy.path()]);
    let assigned = registry.assign("dep-shared01").await.unwrap();
    assert_eq!(registry.find("dep-shared01").await.unwrap(), Some(assigned));
}

#[tokio::test]
async fn test_loose_scan_matches_directory_name() {
    let persistent = tempfile::tempdir().unwrap();
    let legacy = tempfile::tempdir().unwrap();
    std::fs::create_dir(legacy.path().join("Dep_Web_Cluster")).unwrap();

    let registry = registry(persistent.path(), &[legacy.path()]);
    let found = registry.find("dep-web-cluster").await.unwrap();
    assert_eq!(found, Some(legacy.path().join("Dep_Web_Cluster")));
}

#[tokio::test]
async fn test_loose_scan_matches_state_content() {
    let persistent = tempfile::tempdir().unwrap();
    let legacy = tempfile::tempdir().unwrap();
    let old = legacy.path().join("run-2023-07");
    std::fs::create_dir(&old).unwrap();
    std::fs::write(
        old.join(STATE_FILE),
        r#"{"version": 4, "resources": [], "outputs": {"deployment": {"value": "dep-8c1d55aa"}}}"#,
    )
    .unwrap();

    let registry = registry(persistent.path(), &[legacy.path()]);
    assert_eq!(registry.find("dep-8c1d55aa").await.unwrap(), Some(old));
}

#[tokio::test]
async fn test_find_rejects_unsafe_ids() {
    let persistent = tempfile::tempdir().unwrap();
    let registry = registry(persistent.path(), &[]);

    assert_eq!(registry.find("../etc").await.unwrap(), None);
    assert!(matches!(
        registry.assign("a/b").await,
        Err(AgentError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_short_ids_are_not_loosely_matched() {
    let persistent = tempfile::tempdir().unwrap();
    std::fs::create_dir(persistent.path().join("a-b-c")).unwrap();
    let registry = registry(persistent.path(), &[]);
    assert_eq!(registry.find("abc").await.unwrap(), None);
}
