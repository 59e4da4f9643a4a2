//! Failure recovery tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_terminal, ApplyScript, Harness};
use infragent::deploy::tool::Phase;
use infragent::errors::AgentError;
use infragent::filesys::file::File;
use infragent::models::deployment::DeploymentStatus;
use infragent::models::failure::FailureKind;
use infragent::models::parameter::{ParamValue, ParameterSet};
use infragent::recovery::alternatives::AlternativePolicy;
use infragent::recovery::history::FailureLog;
use infragent::recovery::{RecoveryAction, RecoveryCoordinator, RecoveryOptions, RECOVERY_PLAN_FILE};
use infragent::storage::settings::RecoverySettings;
use infragent::utils::CooldownOptions;

const SKU_ERROR: &str = "Error: creating Kubernetes Cluster: SkuNotAvailable: The requested VM size is currently not available in location 'eastus'.";

async fn coordinator(harness: &Harness) -> RecoveryCoordinator {
    let log = FailureLog::open(File::new(harness.root.path().join("failures.jsonl")))
        .await
        .unwrap();
    RecoveryCoordinator::new(
        harness.tracker.clone(),
        Arc::new(log),
        AlternativePolicy::from(&RecoverySettings::default()),
        RecoveryOptions {
            max_attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 2.0,
            },
        },
    )
}

fn cluster(name: &str) -> ParameterSet {
    ParameterSet::new().with("cluster_name", ParamValue::text(name))
}

#[tokio::test]
async fn test_capacity_failure_retries_with_untried_size() {
    let harness = Harness::new();
    harness.tool.script_applies([
        ApplyScript::Fail(vec![SKU_ERROR.to_string()]),
        ApplyScript::Fail(vec![SKU_ERROR.to_string()]),
        ApplyScript::Fail(vec![SKU_ERROR.to_string()]),
    ]);
    let recovery = coordinator(&harness).await;

    let first = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &first).await;
    assert_eq!(view.status, DeploymentStatus::Failed);
    assert_eq!(
        view.error_classification,
        Some(FailureKind::CapacityConstraint)
    );

    let RecoveryAction::Retried {
        new_id: second,
        kind,
        adjusted,
        ..
    } = recovery.handle_failure(&first).await.unwrap()
    else {
        panic!("expected a retry");
    };
    assert_eq!(kind, FailureKind::CapacityConstraint);
    assert_eq!(
        adjusted.get("node_vm_size"),
        Some(&ParamValue::text("Standard_D2as_v5"))
    );
    assert_eq!(
        adjusted.get("cluster_name"),
        Some(&ParamValue::text("aks-demo"))
    );

    // A chain is retried once per link
    assert!(matches!(
        recovery.handle_failure(&first).await,
        Err(AgentError::InvalidTransition(_))
    ));

    let view = wait_terminal(&harness.tracker, &second).await;
    assert_eq!(view.retry_of.as_deref(), Some(first.as_str()));
    assert_eq!(view.attempt, 2);

    // Both failed sizes are excluded from the next suggestion
    let RecoveryAction::Retried {
        new_id: third,
        adjusted,
        ..
    } = recovery.handle_failure(&second).await.unwrap()
    else {
        panic!("expected a second retry");
    };
    assert_eq!(
        adjusted.get("node_vm_size"),
        Some(&ParamValue::text("Standard_B2s"))
    );

    wait_terminal(&harness.tracker, &third).await;
    let action = recovery.handle_failure(&third).await.unwrap();
    assert!(matches!(
        action,
        RecoveryAction::ManualIntervention {
            kind: FailureKind::CapacityConstraint,
            ..
        }
    ));
    assert_eq!(recovery.failure_log().len(), 3);
    assert_eq!(recovery.failure_log().for_template("aks").len(), 3);
}

#[tokio::test]
async fn test_failure_history_survives_reopen() {
    let harness = Harness::new();
    harness
        .tool
        .script_applies([ApplyScript::Fail(vec![SKU_ERROR.to_string()])]);
    let recovery = coordinator(&harness).await;

    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &id).await;
    recovery.handle_failure(&id).await.unwrap();

    let reopened = FailureLog::open(File::new(harness.root.path().join("failures.jsonl")))
        .await
        .unwrap();
    let records = reopened.for_deployment(&id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, FailureKind::CapacityConstraint);
    assert_eq!(
        records[0].value_of("node_vm_size").and_then(|v| v.as_str()),
        Some("Standard_D2s_v3")
    );
}

#[tokio::test]
async fn test_unknown_failure_needs_manual_intervention() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Fail(vec![
        "Error: Invalid reference to undeclared resource".to_string(),
    ])]);
    let recovery = coordinator(&harness).await;

    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &id).await;

    let RecoveryAction::ManualIntervention {
        deployment_id,
        kind,
        reason,
        working_directory,
    } = recovery.handle_failure(&id).await.unwrap()
    else {
        panic!("expected manual intervention");
    };
    assert_eq!(deployment_id, id);
    assert_eq!(kind, FailureKind::Unknown);
    assert!(reason.contains("Invalid reference"));
    assert!(working_directory.ends_with(&id));
}

#[tokio::test]
async fn test_existing_resource_is_imported_on_retry() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Fail(vec![
        "Error: A resource with the ID \"/subscriptions/0000/resourceGroups/rg-aks-demo\" already exists - to be managed via Terraform this resource needs to be imported into the State.".to_string(),
        String::new(),
        "  with azurerm_resource_group.main,".to_string(),
        "  on main.tf line 12, in resource \"azurerm_resource_group\" \"main\":".to_string(),
    ])]);
    let recovery = coordinator(&harness).await;

    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.error_classification, Some(FailureKind::NamingConflict));

    let RecoveryAction::ImportRetried { new_id, imports, .. } =
        recovery.handle_failure(&id).await.unwrap()
    else {
        panic!("expected an import retry");
    };
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].address, "azurerm_resource_group.main");

    let view = wait_terminal(&harness.tracker, &new_id).await;
    assert_eq!(view.status, DeploymentStatus::Completed);
    assert!(harness.tool.calls_for(&new_id).contains(&Phase::Import));
    let record = harness.tracker.get_record(&new_id).await.unwrap();
    assert!(record.is_imported("azurerm_resource_group.main"));
    assert_eq!(
        record.parameters,
        harness.tracker.get_record(&id).await.unwrap().parameters
    );
}

#[tokio::test]
async fn test_partial_apply_produces_a_plan_and_no_retry() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Partial {
        created: 1,
        error: "Error: creating Kubernetes Cluster: unexpected status 500".to_string(),
    }]);
    let recovery = coordinator(&harness).await;

    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &id).await;
    assert_eq!(view.status, DeploymentStatus::PartiallyFailed);

    let RecoveryAction::ManualCleanup(plan) = recovery.handle_failure(&id).await.unwrap() else {
        panic!("expected a cleanup plan");
    };
    assert_eq!(plan.matched, vec!["azurerm_resource_group.main"]);
    assert_eq!(plan.missing, vec!["azurerm_kubernetes_cluster.main"]);
    assert!(plan.extras.is_empty());
    assert!(!plan.needs_review());
    assert!(view.working_directory.join(RECOVERY_PLAN_FILE).exists());

    // Nothing new was started
    assert_eq!(harness.tracker.list_records().len(), 1);
    assert!(!harness.tracker.is_busy(&id));
}

#[tokio::test]
async fn test_completed_deployments_are_not_recovered() {
    let harness = Harness::new();
    let recovery = coordinator(&harness).await;
    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &id).await;

    assert!(matches!(
        recovery.handle_failure(&id).await,
        Err(AgentError::InvalidTransition(_))
    ));
    assert!(recovery.failure_log().is_empty());
}

#[tokio::test]
async fn test_import_existing_binds_declared_resource() {
    let harness = Harness::new();
    harness.tool.script_applies([ApplyScript::Fail(vec![
        "Error: Invalid reference".to_string(),
    ])]);
    let recovery = coordinator(&harness).await;
    let id = harness
        .tracker
        .start_async("aks", cluster("aks-demo"))
        .await
        .unwrap();
    wait_terminal(&harness.tracker, &id).await;

    assert!(matches!(
        recovery
            .import_existing(&id, "azurerm_storage_account.logs", "/subscriptions/x")
            .await,
        Err(AgentError::ConfigError(_))
    ));

    let record = recovery
        .import_existing(
            &id,
            "azurerm_resource_group.main",
            "/subscriptions/0000/resourceGroups/rg-aks-demo",
        )
        .await
        .unwrap();
    assert!(record.is_imported("azurerm_resource_group.main"));
    assert_eq!(record.resources, vec!["azurerm_resource_group.main"]);
    assert!(!harness.tracker.is_busy(&id));
}

#[tokio::test]
async fn test_retry_is_linked_even_when_its_parameters_already_succeeded() {
    let harness = Harness::new();
    harness.tool.script_applies([
        ApplyScript::Succeed,
        ApplyScript::Fail(vec![SKU_ERROR.to_string()]),
    ]);
    let recovery = coordinator(&harness).await;

    // The size recovery will suggest has already been deployed once
    let completed = harness
        .tracker
        .start_async(
            "aks",
            cluster("c1").with("node_vm_size", ParamValue::text("Standard_D2as_v5")),
        )
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &completed).await;
    assert_eq!(view.status, DeploymentStatus::Completed);

    let failed = harness
        .tracker
        .start_async("aks", cluster("c1"))
        .await
        .unwrap();
    let view = wait_terminal(&harness.tracker, &failed).await;
    assert_eq!(view.status, DeploymentStatus::Failed);

    let RecoveryAction::Retried {
        new_id, adjusted, ..
    } = recovery.handle_failure(&failed).await.unwrap()
    else {
        panic!("expected a retry");
    };
    assert_eq!(
        adjusted.get("node_vm_size"),
        Some(&ParamValue::text("Standard_D2as_v5"))
    );
    assert_ne!(new_id, completed);
    assert_ne!(new_id, failed);

    let view = wait_terminal(&harness.tracker, &new_id).await;
    assert_eq!(view.status, DeploymentStatus::Completed);
    assert_eq!(view.retry_of.as_deref(), Some(failed.as_str()));
    assert_eq!(view.attempt, 2);

    // The link is what stops a second retry of the same failure
    assert!(matches!(
        recovery.handle_failure(&failed).await,
        Err(AgentError::InvalidTransition(_))
    ));
    assert_eq!(harness.tracker.list_records().len(), 3);
}
