//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use openapi_server::models::{
    AnswerRequest, AnswerResponse, ClusterResponse, DeployResponse, FreeformRequest,
    FreeformResponse, HealthResponse, ImportRequest, InvalidateResponse, OperationResponse,
    RecoveryPlanResponse, RecoveryResponse, RejectedValue, ResolveQuery, SessionResponse,
    StartSessionRequest, StatusQuery, StatusResponse, VersionResponse,
};
use serde_json::{Map, Value};

use crate::collect::{AnswerOutcome, CollectionSession};
use crate::deploy::tracker::StatusView;
use crate::errors::AgentError;
use crate::models::cluster::{ClusterConnection, ClusterIdentity};
use crate::models::parameter::ParameterSet;
use crate::recovery::partial::RecoveryPlan;
use crate::recovery::RecoveryAction;
use crate::server::error::ApiError;
use crate::server::state::ServerState;
use crate::utils::version_info;

type ApiResult<T> = Result<T, ApiError>;

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "infragent".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ SESSIONS ====================================== //

pub async fn start_session_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state.collector.start_session(&request.template_id).await?;
    Ok((StatusCode::CREATED, Json(session_response(&session))))
}

pub async fn get_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.collector.session(&session_id).await?;
    Ok(Json(session_response(&session)))
}

pub async fn answer_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<Json<AnswerResponse>> {
    let outcome = state
        .collector
        .submit_answer(&session_id, &request.answer)
        .await?;
    Ok(Json(answer_response(&outcome)))
}

pub async fn freeform_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(request): Json<FreeformRequest>,
) -> ApiResult<Json<FreeformResponse>> {
    let outcome = state
        .collector
        .collect_from_freeform(&session_id, &request.text)
        .await?;
    Ok(Json(FreeformResponse {
        extracted: outcome.extracted,
        rejected: outcome
            .rejected
            .into_iter()
            .map(|(parameter, reason)| RejectedValue { parameter, reason })
            .collect(),
        next: answer_response(&outcome.next),
    }))
}

pub async fn cancel_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.collector.cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deploy_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let deployment_id = state
        .collector
        .handoff(&session_id, &state.tracker)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            status_url: format!("/deployments/{}/status", deployment_id),
            deployment_id,
        }),
    ))
}

// =============================== DEPLOYMENTS ==================================== //

pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let view = match query.since {
        Some(cursor) => state.tracker.poll_since(&deployment_id, cursor).await,
        None => state.tracker.poll_status(&deployment_id).await,
    };
    let view = deployment_scoped(&state, &deployment_id, view).await?;
    Ok(Json(status_response(view)))
}

pub async fn cancel_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let cancelled = state.tracker.cancel(&deployment_id).await;
    deployment_scoped(&state, &deployment_id, cancelled).await?;
    let view = state.tracker.poll_status(&deployment_id).await?;
    Ok(Json(status_response(view)))
}

pub async fn destroy_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let started = state.tracker.destroy(&deployment_id).await;
    deployment_scoped(&state, &deployment_id, started).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            deployment_id,
            accepted: true,
            message: "destroy started; poll status for progress".to_string(),
        }),
    ))
}

pub async fn recover_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<RecoveryResponse>> {
    let action = state.recovery.handle_failure(&deployment_id).await;
    let action = deployment_scoped(&state, &deployment_id, action).await?;
    Ok(Json(recovery_response(action)))
}

pub async fn recovery_plan_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<Json<RecoveryPlanResponse>> {
    let plan = state.recovery.recover_partial(&deployment_id).await;
    let plan = deployment_scoped(&state, &deployment_id, plan).await?;
    Ok(Json(plan_response(plan)))
}

pub async fn import_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<Json<StatusResponse>> {
    let imported = state
        .recovery
        .import_existing(&deployment_id, &request.address, &request.external_id)
        .await;
    deployment_scoped(&state, &deployment_id, imported).await?;
    let view = state.tracker.poll_status(&deployment_id).await?;
    Ok(Json(status_response(view)))
}

/// Attach the deployment id and directory to a failure
async fn deployment_scoped<T>(
    state: &ServerState,
    deployment_id: &str,
    result: Result<T, AgentError>,
) -> ApiResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(error) => {
            let working_directory = match &error {
                AgentError::NotFound(_) => None,
                _ => state
                    .tracker
                    .get_record(deployment_id)
                    .await
                    .ok()
                    .map(|r| r.working_directory),
            };
            Err(ApiError::from(error).with_deployment(deployment_id, working_directory))
        }
    }
}

// ================================ CLUSTERS ====================================== //

pub async fn resolve_cluster_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ClusterResponse>> {
    let hint = query.name.as_deref().filter(|h| !h.trim().is_empty());
    let connection = state.discovery.resolve(hint).await?;
    Ok(Json(cluster_response(&connection)))
}

pub async fn invalidate_cluster_handler(
    State(state): State<Arc<ServerState>>,
    Path((deployment_id, name)): Path<(String, String)>,
) -> ApiResult<Json<InvalidateResponse>> {
    let identity = ClusterIdentity::new(deployment_id, name);
    let invalidated = state.discovery.invalidate(&identity);
    Ok(Json(InvalidateResponse {
        deployment_id: identity.deployment_id,
        name: identity.name,
        invalidated,
    }))
}

// =============================== CONVERSIONS ==================================== //

fn redacted_map(parameters: &ParameterSet) -> Map<String, Value> {
    parameters
        .redacted()
        .into_iter()
        .map(|p| (p.name, p.value))
        .collect()
}

fn session_response(session: &CollectionSession) -> SessionResponse {
    SessionResponse {
        session_id: session.session_id.clone(),
        template_id: session.template_id.clone(),
        state: session.state.as_str().to_string(),
        question: session.current_question(),
        pending: session.pending.iter().map(|d| d.name.clone()).collect(),
        collected: redacted_map(&session.collected),
    }
}

fn answer_response(outcome: &AnswerOutcome) -> AnswerResponse {
    match outcome {
        AnswerOutcome::NextQuestion {
            parameter,
            question,
        } => AnswerResponse {
            outcome: "next_question".to_string(),
            parameter: Some(parameter.clone()),
            question: Some(question.clone()),
            reason: None,
            collected: None,
        },
        AnswerOutcome::Retry {
            parameter,
            question,
            reason,
        } => AnswerResponse {
            outcome: "retry".to_string(),
            parameter: Some(parameter.clone()),
            question: Some(question.clone()),
            reason: Some(reason.clone()),
            collected: None,
        },
        AnswerOutcome::Complete { collected } => AnswerResponse {
            outcome: "complete".to_string(),
            parameter: None,
            question: None,
            reason: None,
            collected: Some(redacted_map(collected)),
        },
    }
}

fn status_response(view: StatusView) -> StatusResponse {
    StatusResponse {
        deployment_id: view.deployment_id,
        status: view.status.as_str().to_string(),
        phase: view.phase.as_str().to_string(),
        message: view.message,
        output_tail: view.output_tail,
        cursor: view.cursor,
        resources_created: view.resources_created,
        untracked_resources: view.untracked_resources,
        error_classification: view.error_classification.map(|k| k.as_str().to_string()),
        working_directory: view.working_directory.display().to_string(),
        retry_of: view.retry_of,
        attempt: view.attempt,
        keep_polling: view.keep_polling,
    }
}

fn plan_response(plan: RecoveryPlan) -> RecoveryPlanResponse {
    RecoveryPlanResponse {
        steps: plan.steps(),
        deployment_id: plan.deployment_id,
        working_directory: plan.working_directory.display().to_string(),
        matched: plan.matched,
        missing: plan.missing,
        extras: plan.extras,
        created_at: plan.created_at,
    }
}

fn recovery_response(action: RecoveryAction) -> RecoveryResponse {
    let empty = |action: &str, deployment_id: String| RecoveryResponse {
        action: action.to_string(),
        deployment_id,
        new_deployment_id: None,
        failure_kind: None,
        adjusted: None,
        imports: Vec::new(),
        delay_secs: None,
        plan: None,
        reason: None,
        working_directory: None,
    };
    match action {
        RecoveryAction::Retried {
            previous_id,
            new_id,
            kind,
            adjusted,
            delay,
        } => RecoveryResponse {
            new_deployment_id: Some(new_id),
            failure_kind: Some(kind.as_str().to_string()),
            adjusted: Some(redacted_map(&adjusted)),
            delay_secs: Some(delay.as_secs()),
            ..empty("retried", previous_id)
        },
        RecoveryAction::ImportRetried {
            previous_id,
            new_id,
            imports,
        } => RecoveryResponse {
            new_deployment_id: Some(new_id),
            imports: imports
                .into_iter()
                .map(|h| ImportRequest {
                    address: h.address,
                    external_id: h.external_id,
                })
                .collect(),
            ..empty("import_retried", previous_id)
        },
        RecoveryAction::ManualCleanup(plan) => {
            let mut response = empty("manual_cleanup", plan.deployment_id.clone());
            response.failure_kind = Some("partial_apply".to_string());
            response.working_directory = Some(plan.working_directory.display().to_string());
            response.plan = Some(plan_response(plan));
            response
        }
        RecoveryAction::ManualIntervention {
            deployment_id,
            working_directory,
            kind,
            reason,
        } => RecoveryResponse {
            failure_kind: Some(kind.as_str().to_string()),
            reason: Some(reason),
            working_directory: Some(working_directory.display().to_string()),
            ..empty("manual_intervention", deployment_id)
        },
    }
}

fn cluster_response(connection: &ClusterConnection) -> ClusterResponse {
    ClusterResponse {
        deployment_id: connection.source_deployment_id.clone(),
        name: connection.identity.name.clone(),
        host: connection.credentials.host.clone(),
        last_health_check_at: connection.last_health_check_at,
        expires_at: connection.credentials.expires_at,
    }
}
