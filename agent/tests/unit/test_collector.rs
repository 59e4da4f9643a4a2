//! Parameter collector tests

mod common;

use std::sync::Arc;

use infragent::collect::{AnswerOutcome, CollectionState, ParameterCollector};
use infragent::errors::AgentError;
use infragent::filesys::dir::Dir;
use infragent::models::parameter::{ParamValue, ParameterSet};
use infragent::templates::MemoryTemplateCatalog;

const VM_TEMPLATE: &str = r#"
variable "vm_name" {
  type        = string
  description = "the VM name"
  validation {
    condition     = can(regex("^[a-z][a-z0-9-]{2,15}$", var.vm_name))
    error_message = "lowercase, 3-16 characters"
  }
}

variable "vm_size" {
  type    = string
  default = "Standard_B2s"
  validation {
    condition     = contains(["Standard_B2s", "Standard_D2s_v3"], var.vm_size)
    error_message = "unsupported size"
  }
}

variable "disk_gb" {
  type    = number
  default = 64
}

variable "public_ip" {
  type    = bool
  default = false
}

variable "admin_password" {
  type      = string
  sensitive = true
}

resource "azurerm_linux_virtual_machine" "main" {
  name = var.vm_name
}
"#;

fn collector(root: &std::path::Path) -> ParameterCollector {
    let catalog = Arc::new(MemoryTemplateCatalog::new());
    catalog
        .insert_source("network", common::NETWORK_TEMPLATE)
        .unwrap();
    catalog.insert_source("vm", VM_TEMPLATE).unwrap();
    ParameterCollector::new(catalog, Dir::new(root.join("sessions")))
}

#[tokio::test]
async fn test_all_defaults_accepted_with_empty_answers() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());

    let session = collector.start_session("network").await.unwrap();
    assert_eq!(
        session.state,
        CollectionState::AwaitingAnswer {
            parameter: "name".to_string(),
            retries: 0
        }
    );

    let id = session.session_id.clone();
    let first = collector.submit_answer(&id, "").await.unwrap();
    assert!(matches!(first, AnswerOutcome::NextQuestion { ref parameter, .. } if parameter == "location"));
    collector.submit_answer(&id, "").await.unwrap();
    let last = collector.submit_answer(&id, "   ").await.unwrap();

    let expected = ParameterSet::new()
        .with("name", ParamValue::text("demo"))
        .with("location", ParamValue::text("eastus"))
        .with("address_space", ParamValue::text("10.0.0.0/16"));
    assert_eq!(last, AnswerOutcome::Complete { collected: expected });
    assert_eq!(
        collector.session(&id).await.unwrap().state,
        CollectionState::Complete
    );
}

#[tokio::test]
async fn test_invalid_answer_is_asked_again() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());
    let id = collector.start_session("vm").await.unwrap().session_id;

    let outcome = collector.submit_answer(&id, "Not A Name!").await.unwrap();
    let AnswerOutcome::Retry {
        parameter, reason, ..
    } = outcome
    else {
        panic!("expected a retry, got {:?}", outcome);
    };
    assert_eq!(parameter, "vm_name");
    assert!(!reason.is_empty());

    let session = collector.session(&id).await.unwrap();
    assert_eq!(
        session.state,
        CollectionState::AwaitingAnswer {
            parameter: "vm_name".to_string(),
            retries: 1
        }
    );

    let outcome = collector.submit_answer(&id, "web-01").await.unwrap();
    assert!(matches!(outcome, AnswerOutcome::NextQuestion { ref parameter, .. } if parameter == "vm_size"));
}

#[tokio::test]
async fn test_typed_answers_are_coerced() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());
    let id = collector.start_session("vm").await.unwrap().session_id;

    collector.submit_answer(&id, "web-01").await.unwrap();
    // Choices are canonicalized case-insensitively
    collector.submit_answer(&id, "standard_d2s_v3").await.unwrap();
    let retry = collector.submit_answer(&id, "lots").await.unwrap();
    assert!(matches!(retry, AnswerOutcome::Retry { ref parameter, .. } if parameter == "disk_gb"));
    collector.submit_answer(&id, "128").await.unwrap();
    collector.submit_answer(&id, "yes").await.unwrap();
    let done = collector.submit_answer(&id, "hunter2").await.unwrap();

    let AnswerOutcome::Complete { collected } = done else {
        panic!("expected completion");
    };
    assert_eq!(
        collected.get("vm_size"),
        Some(&ParamValue::text("Standard_D2s_v3"))
    );
    assert_eq!(collected.get("disk_gb"), Some(&ParamValue::Number(128.0)));
    assert_eq!(collected.get("public_ip"), Some(&ParamValue::Bool(true)));
    assert!(collected.get("admin_password").unwrap().is_secret());
}

#[tokio::test]
async fn test_freeform_fills_pending_parameters() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());
    let id = collector.start_session("vm").await.unwrap().session_id;

    let outcome = collector
        .collect_from_freeform(
            &id,
            "please create vm-name: web-02, disk_gb=32 and public_ip=maybe",
        )
        .await
        .unwrap();
    assert_eq!(outcome.extracted, 2);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].0, "public_ip");
    // The head of the queue moved past the answered name
    assert!(matches!(outcome.next, AnswerOutcome::NextQuestion { ref parameter, .. } if parameter == "vm_size"));

    let session = collector.session(&id).await.unwrap();
    assert_eq!(
        session.collected.get("vm_name"),
        Some(&ParamValue::text("web-02"))
    );
    assert!(session.missing().contains(&"admin_password".to_string()));
    assert!(!session.can_hand_off());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());
    let a = collector.start_session("network").await.unwrap().session_id;
    let b = collector.start_session("network").await.unwrap().session_id;
    assert_ne!(a, b);

    collector.submit_answer(&a, "alpha").await.unwrap();
    let session_b = collector.session(&b).await.unwrap();
    assert!(session_b.collected.is_empty());
    assert_eq!(session_b.current().unwrap().name, "name");
}

#[tokio::test]
async fn test_unknown_and_closed_sessions() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());

    assert!(matches!(
        collector.submit_answer("ses-missing", "x").await,
        Err(AgentError::SessionNotFound(_))
    ));

    let id = collector.start_session("network").await.unwrap().session_id;
    for _ in 0..3 {
        collector.submit_answer(&id, "").await.unwrap();
    }
    assert!(matches!(
        collector.submit_answer(&id, "extra").await,
        Err(AgentError::SessionComplete(_))
    ));

    let other = collector.start_session("network").await.unwrap().session_id;
    collector.cancel(&other).await.unwrap();
    assert!(matches!(
        collector.submit_answer(&other, "x").await,
        Err(AgentError::SessionCancelled(_))
    ));
    assert!(collector.session(&other).await.unwrap().collected.is_empty());
}

#[tokio::test]
async fn test_unknown_template_is_a_config_error() {
    let root = tempfile::tempdir().unwrap();
    let collector = collector(root.path());
    assert!(matches!(
        collector.start_session("nope").await,
        Err(AgentError::ConfigError(_))
    ));
}

#[tokio::test]
async fn test_restore_requeues_secrets() {
    let root = tempfile::tempdir().unwrap();
    let id = {
        let collector = collector(root.path());
        let id = collector.start_session("vm").await.unwrap().session_id;
        collector
            .collect_from_freeform(&id, "vm_name=web-03 admin_password=hunter2")
            .await
            .unwrap();
        id
    };

    let collector = collector(root.path());
    assert_eq!(collector.restore().await.unwrap(), 1);
    let session = collector.session(&id).await.unwrap();
    assert_eq!(
        session.collected.get("vm_name"),
        Some(&ParamValue::text("web-03"))
    );
    assert!(session.collected.get("admin_password").is_none());
    assert!(session.pending.iter().any(|d| d.name == "admin_password"));
}

#[tokio::test]
async fn test_handoff_starts_a_deployment() {
    let harness = common::Harness::new();
    let collector = ParameterCollector::new(
        harness.catalog.clone(),
        Dir::new(harness.root.path().join("sessions")),
    );
    let id = collector.start_session("network").await.unwrap().session_id;
    collector.submit_answer(&id, "edge").await.unwrap();

    // Remaining parameters have defaults
    let deployment_id = collector.handoff(&id, &harness.tracker).await.unwrap();
    assert!(matches!(
        collector.session(&id).await,
        Err(AgentError::SessionNotFound(_))
    ));

    let view = common::wait_terminal(&harness.tracker, &deployment_id).await;
    assert!(view.status.is_terminal());
    let parameters = harness.tracker.parameters_of(&deployment_id).await.unwrap();
    assert_eq!(parameters.get("name"), Some(&ParamValue::text("edge")));
    assert_eq!(parameters.get("location"), Some(&ParamValue::text("eastus")));
}
