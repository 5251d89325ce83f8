//! Task Repository
//!
//! Database operations for tasks. Every state change is a single conditional
//! `UPDATE` whose `WHERE` clause encodes the expected prior state, so racing
//! nodes are serialized by Postgres and the loser sees zero affected rows.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskStatus};
use taskpool_core::dto::task::TaskQuery;

const TASK_COLUMNS: &str = r#"
    id, project, spec_reference, dependencies, status, lease_owner,
    claimed_at, heartbeat_at, finished_at, timeout_secs, command,
    working_dir, env, error, created_at
"#;

/// Insert a new task
pub async fn insert(pool: &PgPool, task: &Task) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, project, spec_reference, dependencies, status,
                           timeout_secs, command, working_dir, env, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&task.id)
    .bind(&task.project)
    .bind(&task.spec_reference)
    .bind(&task.dependencies)
    .bind(task.status.as_str())
    .bind(task.timeout_secs.map(|secs| secs as i64))
    .bind(&task.command)
    .bind(&task.working_dir)
    .bind(serde_json::to_value(&task.env).unwrap_or_default())
    .bind(task.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Task>, sqlx::Error> {
    let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);

    let row = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(Into::into))
}

/// Stored result record of a finished task
pub async fn find_result(pool: &PgPool, id: &str) -> Result<Option<TaskResult>, sqlx::Error> {
    let value: Option<Option<serde_json::Value>> =
        sqlx::query_scalar("SELECT result FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(value
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok()))
}

pub async fn list(pool: &PgPool, query: &TaskQuery) -> Result<Vec<Task>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {} FROM tasks
        WHERE ($1::TEXT IS NULL OR project = $1)
          AND ($2::TEXT IS NULL OR status = $2)
        ORDER BY created_at DESC
        "#,
        TASK_COLUMNS
    );

    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(&query.project)
        .bind(query.status.map(|s| s.as_str()))
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Pending tasks whose dependencies have all completed, oldest first
pub async fn find_eligible(pool: &PgPool, project: Option<&str>) -> Result<Vec<Task>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT {} FROM tasks t
        WHERE t.status = 'PENDING'
          AND ($1::TEXT IS NULL OR t.project = $1)
          AND NOT EXISTS (
              SELECT 1 FROM unnest(t.dependencies) AS dep(id)
              WHERE NOT EXISTS (
                  SELECT 1 FROM tasks d WHERE d.id = dep.id AND d.status = 'COMPLETED'
              )
          )
        ORDER BY t.created_at ASC
        "#,
        TASK_COLUMNS
    );

    let rows = sqlx::query_as::<_, TaskRow>(&sql)
        .bind(project)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// `PENDING → CLAIMED` for `node_id`; `false` if the task was not pending
pub async fn claim(
    pool: &PgPool,
    id: &str,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'CLAIMED', lease_owner = $2, claimed_at = $3, heartbeat_at = NULL
        WHERE id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(id)
    .bind(node_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Renew the lease; the first heartbeat moves `CLAIMED → RUNNING`
///
/// Returns `false` when `node_id` does not hold an active lease.
pub async fn heartbeat(
    pool: &PgPool,
    id: &str,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET heartbeat_at = $3,
            status = CASE WHEN status = 'CLAIMED' THEN 'RUNNING' ELSE status END
        WHERE id = $1 AND lease_owner = $2 AND status IN ('CLAIMED', 'RUNNING')
        "#,
    )
    .bind(id)
    .bind(node_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move an active task held by `node_id` to a terminal status
///
/// Returns `false` when `node_id` does not hold an active lease.
pub async fn finish(
    pool: &PgPool,
    id: &str,
    node_id: &str,
    status: TaskStatus,
    error: Option<&str>,
    result: Option<&TaskResult>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result_json = result.and_then(|r| serde_json::to_value(r).ok());

    let outcome = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $3, error = $4, result = $5, finished_at = $6, heartbeat_at = $6
        WHERE id = $1 AND lease_owner = $2 AND status IN ('CLAIMED', 'RUNNING')
        "#,
    )
    .bind(id)
    .bind(node_id)
    .bind(status.as_str())
    .bind(error)
    .bind(result_json)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() == 1)
}

/// Return active tasks silent since before `cutoff` to `PENDING`
pub async fn reap_expired(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'PENDING', lease_owner = NULL, claimed_at = NULL, heartbeat_at = NULL
        WHERE status IN ('CLAIMED', 'RUNNING')
          AND COALESCE(heartbeat_at, claimed_at, created_at) < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    project: String,
    spec_reference: String,
    dependencies: Vec<String>,
    status: String,
    lease_owner: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    timeout_secs: Option<i64>,
    command: Option<String>,
    working_dir: Option<String>,
    env: serde_json::Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        let status = row.status.parse().unwrap_or_else(|_| {
            tracing::warn!(
                "Task {} has unknown status '{}', treating it as FAILED",
                row.id,
                row.status
            );
            TaskStatus::Failed
        });

        Task {
            id: row.id,
            project: row.project,
            spec_reference: row.spec_reference,
            dependencies: row.dependencies,
            status,
            lease_owner: row.lease_owner,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            finished_at: row.finished_at,
            timeout_secs: row.timeout_secs.map(|secs| secs.max(0) as u64),
            command: row.command,
            working_dir: row.working_dir,
            env: serde_json::from_value(row.env).unwrap_or_default(),
            error: row.error,
            created_at: row.created_at,
        }
    }
}
