//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::AgentError;
use crate::server::handlers::{
    answer_handler, cancel_deployment_handler, cancel_session_handler, deploy_session_handler,
    destroy_handler, freeform_handler, get_session_handler, health_handler, import_handler,
    invalidate_cluster_handler, recover_handler, recovery_plan_handler, resolve_cluster_handler,
    start_session_handler, status_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the command and polling surface
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Parameter collection
        .route("/sessions", post(start_session_handler))
        .route(
            "/sessions/{id}",
            get(get_session_handler).delete(cancel_session_handler),
        )
        .route("/sessions/{id}/answer", post(answer_handler))
        .route("/sessions/{id}/freeform", post(freeform_handler))
        .route("/sessions/{id}/deploy", post(deploy_session_handler))
        // Deployments
        .route("/deployments/{id}/status", get(status_handler))
        .route("/deployments/{id}/cancel", post(cancel_deployment_handler))
        .route("/deployments/{id}/destroy", post(destroy_handler))
        .route("/deployments/{id}/recover", post(recover_handler))
        .route("/deployments/{id}/recovery-plan", get(recovery_plan_handler))
        .route("/deployments/{id}/import", post(import_handler))
        // Clusters
        .route("/clusters/resolve", get(resolve_cluster_handler))
        .route(
            "/clusters/{deployment_id}/{name}/invalidate",
            post(invalidate_cluster_handler),
        )
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AgentError>>, AgentError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AgentError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AgentError::ServerError(e.to_string()))
    });

    Ok(handle)
}
