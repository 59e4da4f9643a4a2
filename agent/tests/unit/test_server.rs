//! HTTP surface tests, driven through the router without a listener

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{wait_terminal, Harness};
use infragent::collect::ParameterCollector;
use infragent::filesys::dir::Dir;
use infragent::filesys::file::File;
use infragent::recovery::alternatives::AlternativePolicy;
use infragent::recovery::history::FailureLog;
use infragent::recovery::{RecoveryCoordinator, RecoveryOptions};
use infragent::server::serve::router;
use infragent::server::state::ServerState;
use infragent::storage::settings::RecoverySettings;

async fn app(harness: &Harness) -> Router {
    let log = FailureLog::open(File::new(harness.root.path().join("failures.jsonl")))
        .await
        .unwrap();
    let recovery = RecoveryCoordinator::new(
        harness.tracker.clone(),
        Arc::new(log),
        AlternativePolicy::from(&RecoverySettings::default()),
        RecoveryOptions::default(),
    );
    let collector = ParameterCollector::new(
        harness.catalog.clone(),
        Dir::new(harness.root.path().join("sessions")),
    );
    router(Arc::new(ServerState::new(
        Arc::new(collector),
        harness.tracker.clone(),
        Arc::new(recovery),
        harness.discovery.clone(),
    )))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::new();
    let app = app(&harness).await;
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "infragent");
}

#[tokio::test]
async fn test_conversation_to_completed_deployment() {
    let harness = Harness::new();
    let app = app(&harness).await;

    let (status, session) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "template_id": "network" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["session_id"].as_str().unwrap().to_string();
    assert!(session["question"].is_string());

    let answer_uri = format!("/sessions/{}/answer", session_id);
    let mut outcome = Value::Null;
    for _ in 0..3 {
        let (status, body) =
            call(&app, Method::POST, &answer_uri, Some(json!({ "answer": "" }))).await;
        assert_eq!(status, StatusCode::OK);
        outcome = body;
    }
    assert_eq!(outcome["outcome"], "complete");
    assert_eq!(outcome["collected"]["address_space"], "10.0.0.0/16");

    let (status, deployed) = call(
        &app,
        Method::POST,
        &format!("/sessions/{}/deploy", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deployment_id = deployed["deployment_id"].as_str().unwrap().to_string();
    assert_eq!(
        deployed["status_url"],
        format!("/deployments/{}/status", deployment_id)
    );

    wait_terminal(&harness.tracker, &deployment_id).await;
    let (status, view) = call(
        &app,
        Method::GET,
        &format!("/deployments/{}/status", deployment_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "completed");
    assert_eq!(view["keep_polling"], false);
    assert_eq!(view["resources_created"].as_array().unwrap().len(), 2);

    // Only output after the cursor
    let cursor = view["cursor"].as_u64().unwrap();
    let (_, tail) = call(
        &app,
        Method::GET,
        &format!("/deployments/{}/status?since={}", deployment_id, cursor),
        None,
    )
    .await;
    assert!(tail["output_tail"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_errors_map_to_categories() {
    let harness = Harness::new();
    let app = app(&harness).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "template_id": "mainframe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["category"], "configuration");

    let (status, body) = call(&app, Method::GET, "/deployments/dep-missing/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["category"], "not_found");
    assert_eq!(body["deployment_id"], "dep-missing");

    let (status, body) = call(&app, Method::GET, "/clusters/resolve?name=prod", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["category"], "discovery");
}

#[tokio::test]
async fn test_cancelled_session_refuses_answers() {
    let harness = Harness::new();
    let app = app(&harness).await;
    let (_, session) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "template_id": "aks" })),
    )
    .await;
    let session_id = session["session_id"].as_str().unwrap();

    let (status, _) = call(&app, Method::DELETE, &format!("/sessions/{}", session_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/sessions/{}/answer", session_id),
        Some(json!({ "answer": "prod" })),
    )
    .await;
    assert!(status.is_client_error());
}
