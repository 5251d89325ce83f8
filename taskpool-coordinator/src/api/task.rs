//! Task API Handlers
//!
//! HTTP endpoints for task submission and the worker claim protocol.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::Task;
use taskpool_core::dto::task::{
    ClaimResponse, ClaimTask, CreateTask, FinishTask, HeartbeatTask, ReapResponse, TaskQuery,
};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::task_service;

// =============================================================================
// Submission & Queries
// =============================================================================

/// POST /api/tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    tracing::info!("Creating task {} in project {}", req.id, req.project);

    let task = task_service::create_task(&state.pool, req).await?;

    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks?project=&status=
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    tracing::debug!("Listing tasks: {:?}", query);

    let tasks = task_service::list_tasks(&state.pool, &query).await?;

    Ok(Json(tasks))
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = task_service::get_task(&state.pool, &id).await?;
    Ok(Json(task))
}

/// GET /api/tasks/{id}/result
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskResult>> {
    task_service::get_result(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Task {} has no result yet", id)))
}

// =============================================================================
// Worker Protocol
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EligibleQuery {
    pub project: Option<String>,
}

/// GET /api/tasks/eligible?project=
pub async fn eligible_tasks(
    State(state): State<AppState>,
    Query(params): Query<EligibleQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let tasks = task_service::eligible_tasks(&state.pool, params.project.as_deref()).await?;
    Ok(Json(tasks))
}

/// POST /api/tasks/{id}/claim
pub async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ClaimTask>,
) -> ApiResult<Json<ClaimResponse>> {
    let claimed = task_service::claim_task(&state.pool, &id, &req.node_id).await?;
    Ok(Json(ClaimResponse { claimed }))
}

/// POST /api/tasks/{id}/heartbeat
///
/// Answers 409 once the caller no longer holds the lease.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatTask>,
) -> ApiResult<StatusCode> {
    task_service::heartbeat(&state.pool, &id, &req.node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/{id}/finish
pub async fn finish_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FinishTask>,
) -> ApiResult<StatusCode> {
    tracing::info!(
        "Node {} finishing task {} with status {}",
        req.node_id,
        id,
        req.status
    );

    task_service::finish_task(
        &state.pool,
        &id,
        &req.node_id,
        req.status,
        req.error,
        req.result,
    )
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/reap
pub async fn reap_expired(State(state): State<AppState>) -> ApiResult<Json<ReapResponse>> {
    let reaped = task_service::reap_expired_leases(&state.pool, state.lease_timeout).await?;
    Ok(Json(ReapResponse { reaped }))
}
