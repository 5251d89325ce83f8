//! Task Service
//!
//! Business logic for the task distribution protocol: creation, eligibility,
//! claiming, lease renewal, completion and lease expiry.

use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskStatus};
use taskpool_core::dto::task::{CreateTask, TaskQuery};
use taskpool_core::protocol::head_chars;
use thiserror::Error;

use crate::repository::task_repository;

/// Longest error message stored with a finished task
pub const MAX_ERROR_CHARS: usize = 2000;

const MAX_ID_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task {0} already exists")]
    AlreadyExists(String),

    #[error("Node {node_id} does not hold the lease on task {task_id}")]
    LeaseLost { task_id: String, node_id: String },

    #[error("{0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Create a new pending task
pub async fn create_task(pool: &PgPool, req: CreateTask) -> Result<Task> {
    validate_create_request(&req)?;

    let task = req.into_task(Utc::now());

    task_repository::insert(pool, &task)
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                TaskError::AlreadyExists(task.id.clone())
            }
            _ => TaskError::DatabaseError(err),
        })?;

    tracing::info!("Task created: {} in project {}", task.key(), task.project);

    Ok(task)
}

pub async fn get_task(pool: &PgPool, id: &str) -> Result<Task> {
    task_repository::find_by_id(pool, id)
        .await?
        .ok_or_else(|| TaskError::NotFound(id.to_string()))
}

/// Result record of a task; `None` until it has finished
pub async fn get_result(pool: &PgPool, id: &str) -> Result<Option<TaskResult>> {
    // Distinguish "no such task" from "no result yet"
    get_task(pool, id).await?;
    Ok(task_repository::find_result(pool, id).await?)
}

pub async fn list_tasks(pool: &PgPool, query: &TaskQuery) -> Result<Vec<Task>> {
    Ok(task_repository::list(pool, query).await?)
}

/// Pending tasks with satisfied dependencies
pub async fn eligible_tasks(pool: &PgPool, project: Option<&str>) -> Result<Vec<Task>> {
    let tasks = task_repository::find_eligible(pool, project).await?;
    tracing::debug!("{} eligible task(s) for project {:?}", tasks.len(), project);
    Ok(tasks)
}

/// Attempt to claim a task
///
/// Returns `Ok(false)` when the task exists but is no longer pending; that is a
/// lost race, not an error.
pub async fn claim_task(pool: &PgPool, id: &str, node_id: &str) -> Result<bool> {
    validate_identifier("node_id", node_id)?;

    if task_repository::claim(pool, id, node_id, Utc::now()).await? {
        tracing::info!("Task {} claimed by node {}", id, node_id);
        return Ok(true);
    }

    // Zero rows: either lost the race or the task does not exist
    let task = get_task(pool, id).await?;
    tracing::debug!(
        "Claim of task {} by node {} rejected (status {}, owner {:?})",
        id,
        node_id,
        task.status,
        task.lease_owner
    );

    Ok(false)
}

/// Renew the lease held by `node_id`
pub async fn heartbeat(pool: &PgPool, id: &str, node_id: &str) -> Result<()> {
    if task_repository::heartbeat(pool, id, node_id, Utc::now()).await? {
        tracing::debug!("Heartbeat for task {} from node {}", id, node_id);
        return Ok(());
    }

    get_task(pool, id).await?;
    Err(TaskError::LeaseLost {
        task_id: id.to_string(),
        node_id: node_id.to_string(),
    })
}

/// Record the final status of a task held by `node_id`
pub async fn finish_task(
    pool: &PgPool,
    id: &str,
    node_id: &str,
    status: TaskStatus,
    error: Option<String>,
    result: Option<TaskResult>,
) -> Result<()> {
    validate_completion_status(status)?;

    let error = error.map(|e| head_chars(&e, MAX_ERROR_CHARS).to_string());

    let updated = task_repository::finish(
        pool,
        id,
        node_id,
        status,
        error.as_deref(),
        result.as_ref(),
        Utc::now(),
    )
    .await?;

    if !updated {
        let task = get_task(pool, id).await?;
        tracing::warn!(
            "Node {} tried to finish task {} without holding its lease (status {}, owner {:?})",
            node_id,
            id,
            task.status,
            task.lease_owner
        );
        return Err(TaskError::LeaseLost {
            task_id: id.to_string(),
            node_id: node_id.to_string(),
        });
    }

    tracing::info!("Task {} finished by node {} with status {}", id, node_id, status);

    Ok(())
}

/// Return tasks whose lease holder has been silent for `lease_timeout` to PENDING
pub async fn reap_expired_leases(pool: &PgPool, lease_timeout: Duration) -> Result<u64> {
    let lease = chrono::Duration::from_std(lease_timeout)
        .map_err(|e| TaskError::ValidationError(format!("Invalid lease timeout: {}", e)))?;

    let count = task_repository::reap_expired(pool, Utc::now() - lease).await?;

    if count > 0 {
        tracing::warn!("Returned {} task(s) with expired leases to PENDING", count);
    }

    Ok(count)
}

/// Periodically reaps expired leases until the process exits
pub fn spawn_reaper(
    pool: PgPool,
    lease_timeout: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            if let Err(e) = reap_expired_leases(&pool, lease_timeout).await {
                tracing::error!("Lease reaper failed: {}", e);
            }
        }
    })
}

// =============================================================================
// Validation
// =============================================================================

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TaskError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }

    if value.len() > MAX_ID_LEN {
        return Err(TaskError::ValidationError(format!(
            "{} is too long (max {} characters)",
            field, MAX_ID_LEN
        )));
    }

    if value.contains('/') {
        return Err(TaskError::ValidationError(format!(
            "{} cannot contain '/'",
            field
        )));
    }

    Ok(())
}

fn validate_create_request(req: &CreateTask) -> Result<()> {
    validate_identifier("id", &req.id)?;
    validate_identifier("project", &req.project)?;

    if req.dependencies.iter().any(|dep| dep == &req.id) {
        return Err(TaskError::ValidationError(format!(
            "Task {} cannot depend on itself",
            req.id
        )));
    }

    if matches!(&req.command, Some(cmd) if cmd.trim().is_empty()) {
        return Err(TaskError::ValidationError(
            "command cannot be blank".to_string(),
        ));
    }

    if req.timeout_secs == Some(0) {
        return Err(TaskError::ValidationError(
            "timeout_secs must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_completion_status(status: TaskStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(TaskError::ValidationError(format!(
            "Invalid completion status: {}",
            status
        )))
    }
}
