//! API Module
//!
//! HTTP API layer for the coordinator.

pub mod error;
pub mod health;
pub mod task;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub lease_timeout: Duration,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Submission & queries
        .route("/api/tasks", post(task::create_task).get(task::list_tasks))
        .route("/api/tasks/eligible", get(task::eligible_tasks))
        .route("/api/tasks/reap", post(task::reap_expired))
        .route("/api/tasks/{id}", get(task::get_task))
        .route("/api/tasks/{id}/result", get(task::get_result))
        // Worker protocol
        .route("/api/tasks/{id}/claim", post(task::claim_task))
        .route("/api/tasks/{id}/heartbeat", post(task::heartbeat))
        .route("/api/tasks/{id}/finish", post(task::finish_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
