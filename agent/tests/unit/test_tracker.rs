//! Deployment tracker tests

mod common;

use std::time::Duration;

use common::{wait_terminal, ApplyScript, Harness};
use infragent::deploy::tool::Phase;
use infragent::deploy::tracker::{DeploymentRequest, TrackerOptions};
use infragent::errors::AgentError;
use infragent::models::deployment::{DeploymentStatus, ProgressPhase};
use infragent::models::failure::FailureKind;
use infragent::models::parameter::{ParamValue, ParameterSet};
use infragent::registry::{OUTPUT_LOG, RECORD_FILE};

fn network(name: &str) -> ParameterSet {
    ParameterSet::new().with("name", ParamValue::text(name))
}

#[tokio::test]
async fn test_start_returns_before_apply_finishes() {
    let harness = Harness::new();
    harness.tool.set_apply_delay(Duration::from_millis(300));

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = harness.tracker.poll_status(&id).await.unwrap();
    assert!(!view.status.is_terminal());
    assert!(view.keep_polling);
    assert!(view.resources_created.is_none());

    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Completed);
    assert_eq!(view.phase, ProgressPhase::Done);
    assert!(!view.keep_polling);
    assert_eq!(
        view.resources_created,
        Some(vec![
            "azurerm_resource_group.main".to_string(),
            "azurerm_virtual_network.main".to_string()
        ])
    );
    assert_eq!(
        harness.tool.calls_for(&id),
        vec![Phase::Init, Phase::Plan, Phase::Apply, Phase::StateList, Phase::Output]
    );
}

#[tokio::test]
async fn test_concurrent_deployments_keep_separate_logs() {
    let harness = Harness::new();
    harness.tool.set_apply_delay(Duration::from_millis(100));

    let a = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let b = harness
        .tracker
        .start_async("network", network("bravo"))
        .await
        .unwrap();
    assert_ne!(a, b);

    let view_a = wait_terminal(&harness.tracker, &a).await;
    let view_b = wait_terminal(&harness.tracker, &b).await;
    assert_eq!(view_a.status, DeploymentStatus::Completed);
    assert_eq!(view_b.status, DeploymentStatus::Completed);
    assert_ne!(view_a.working_directory, view_b.working_directory);

    let log_a = std::fs::read_to_string(view_a.working_directory.join(OUTPUT_LOG)).unwrap();
    let log_b = std::fs::read_to_string(view_b.working_directory.join(OUTPUT_LOG)).unwrap();
    assert!(log_a.contains(&format!("Applying {}", a)));
    assert!(!log_a.contains(&b));
    assert!(log_b.contains(&format!("Applying {}", b)));
    assert!(!log_b.contains(&a));
}

#[tokio::test]
async fn test_repeated_polls_of_a_finished_deployment_agree() {
    let harness = Harness::new();
    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let first = wait_terminal(&harness.tracker, &id).await;
    let second = harness.tracker.poll_status(&id).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_poll_since_returns_only_new_output() {
    let harness = Harness::new();
    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;

    let later = harness.tracker.poll_since(&id, view.cursor).await.unwrap();
    assert!(later.output_tail.is_empty());
    let all = harness.tracker.poll_since(&id, 0).await.unwrap();
    assert!(all.output_tail.iter().any(|l| l == "==> apply"));
}

#[tokio::test]
async fn test_record_is_persisted_with_redacted_secrets() {
    let harness = Harness::new();
    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;

    let raw = std::fs::read_to_string(view.working_directory.join(RECORD_FILE)).unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["id"], id.as_str());
    assert_eq!(record["status"], "completed");
}

#[tokio::test]
async fn test_same_parameters_reuse_the_deployment() {
    let harness = Harness::new();
    harness.tool.set_apply_delay(Duration::from_millis(100));

    let first = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    // Explicit defaults fingerprint the same as omitted ones
    let again = harness
        .tracker
        .start_async(
            "network",
            network("alpha").with("location", ParamValue::text("eastus")),
        )
        .await
        .unwrap();
    assert_eq!(first, again);

    let other = harness
        .tracker
        .start_async("network", network("bravo"))
        .await
        .unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn test_undeclared_and_missing_parameters() {
    let harness = Harness::new();
    let undeclared = harness
        .tracker
        .start_async("network", network("alpha").with("colour", ParamValue::text("red")))
        .await;
    assert!(matches!(undeclared, Err(AgentError::ConfigError(_))));

    let missing = harness
        .tracker
        .start_async("aks", ParameterSet::new())
        .await;
    assert!(matches!(missing, Err(AgentError::ConfigError(_))));

    assert!(matches!(
        harness.tracker.poll_status("dep-unknown00").await,
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_before_apply() {
    let harness = Harness::new();
    harness.tool.set_plan_delay(Duration::from_secs(5));

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = harness.tracker.cancel(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.message.as_deref(), Some("cancelled before apply"));

    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Failed);
    assert!(!harness.tool.calls_for(&id).contains(&Phase::Apply));
}

#[tokio::test]
async fn test_cancel_refused_during_apply() {
    let harness = Harness::new();
    harness.tool.set_apply_delay(Duration::from_millis(400));

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    for _ in 0..100 {
        if harness.tracker.poll_status(&id).await.unwrap().status == DeploymentStatus::Applying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(
        harness.tracker.cancel(&id).await,
        Err(AgentError::InvalidTransition(_))
    ));
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Completed);
}

#[tokio::test]
async fn test_polling_ceiling_stops_callers() {
    let harness = Harness::with_options(TrackerOptions {
        poll_ceiling: Duration::ZERO,
        tail_lines: 10,
    });
    harness.tool.set_apply_delay(Duration::from_millis(300));

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = harness.tracker.poll_status(&id).await.unwrap();
    assert!(!view.status.is_terminal());
    assert!(!view.keep_polling);
    assert!(view.message.unwrap().contains("still running"));

    // The deployment itself is unaffected
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Completed);
}

#[tokio::test]
async fn test_failed_apply_is_classified() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Fail(vec![
        "Error: creating Resource Group: QuotaExceeded: Operation could not be completed as it results in exceeding approved quota.".to_string(),
    ])]);

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Failed);
    assert_eq!(view.error_classification, Some(FailureKind::QuotaExceeded));
    assert_eq!(view.resources_created, Some(Vec::new()));
}

#[tokio::test]
async fn test_partial_apply_reports_live_subset() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Partial {
        created: 1,
        error: "Error: creating Virtual Network: unexpected status 500".to_string(),
    }]);

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::PartiallyFailed);
    assert_eq!(view.error_classification, Some(FailureKind::PartialApply));
    assert_eq!(
        view.resources_created,
        Some(vec!["azurerm_resource_group.main".to_string()])
    );
}

#[tokio::test]
async fn test_records_reload_after_restart() {
    let harness = Harness::new();
    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &id).await;

    let restarted = Harness::new();
    let tracker = std::sync::Arc::new(infragent::deploy::tracker::DeploymentTracker::new(
        TrackerOptions::default(),
        harness.registry.clone(),
        restarted.catalog.clone(),
        std::sync::Arc::new(infragent::deploy::executor::ExecutionEngine::new(
            restarted.tool.clone(),
        )),
        None,
    ));
    assert_eq!(tracker.load_existing().await.unwrap(), 1);
    let record = tracker.get_record(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(record.attempt, 1);
}

#[tokio::test]
async fn test_destroy_removes_directory() {
    let harness = Harness::new();
    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;

    harness.tracker.destroy(&id).await.unwrap();
    for _ in 0..200 {
        if !view.working_directory.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!view.working_directory.exists());
    assert!(matches!(
        harness.tracker.get_record(&id).await,
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retry_request_links_attempts() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Fail(vec![
        "Error: something unexpected".to_string(),
    ])]);
    let first = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &first).await;

    let mut request = DeploymentRequest::new("network", network("alpha"));
    request.retry_of = Some(first.clone());
    let second = harness.tracker.start_request(request).await.unwrap();
    assert_ne!(first, second);

    let view = wait_terminal(&harness.tracker, &second).await;
    assert_eq!(view.retry_of.as_deref(), Some(first.as_str()));
    assert_eq!(view.attempt, 2);
    assert_eq!(view.status, DeploymentStatus::Completed);
}

#[tokio::test]
async fn test_loosely_spelled_id_reaches_the_live_deployment() {
    let harness = Harness::new();
    harness.tool.set_plan_delay(Duration::from_secs(5));

    let id = harness
        .tracker
        .start_async("network", network("alpha"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alias = id.to_uppercase();

    let view = harness.tracker.poll_status(&alias).await.unwrap();
    assert_eq!(view.deployment_id, id);

    let record = harness.tracker.cancel(&alias).await.unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.status, DeploymentStatus::Failed);

    // The running worker saw the cancellation and never applied
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::Failed);
    assert!(!harness.tool.calls_for(&id).contains(&Phase::Apply));
    assert_eq!(harness.tracker.list_records().len(), 1);

    let guard = harness.tracker.acquire(&alias).await.unwrap();
    assert_eq!(guard.record().id, id);
    assert!(harness.tracker.is_busy(&id));
    assert!(matches!(
        harness.tracker.acquire(&id).await,
        Err(AgentError::DeploymentBusy(_))
    ));
    drop(guard);
    assert!(!harness.tracker.is_busy(&id));
}

#[tokio::test]
async fn test_concurrent_identical_starts_share_one_deployment() {
    let harness = Harness::new();
    harness.tool.set_plan_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(
        harness.tracker.start_async("network", network("dup")),
        harness.tracker.start_async("network", network("dup")),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first, second);
    assert_eq!(harness.tracker.list_records().len(), 1);

    wait_terminal(&harness.tracker, &first).await;
    let plans = harness
        .tool
        .calls_for(&first)
        .into_iter()
        .filter(|phase| *phase == Phase::Plan)
        .count();
    assert_eq!(plans, 1);
}
