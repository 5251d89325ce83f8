//! Command-line surface of the coordinator
//!
//! Besides `serve`, every subcommand runs one store operation against the
//! database and prints a single JSON document on stdout. Worker nodes
//! configured with the CLI backend drive the coordinator this way.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::TaskStatus;
use taskpool_core::dto::task::{ClaimResponse, CreateTask, ReapResponse, TaskQuery};

use crate::api::{self, AppState};
use crate::db;
use crate::service::task_service;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the lease reaper
    Serve {
        #[arg(long, env = "COORDINATOR_BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: String,

        /// Seconds between lease reaper sweeps
        #[arg(long, env = "REAP_INTERVAL", default_value_t = 30)]
        reap_interval: u64,
    },
    /// Create the database schema
    Migrate,
    /// Create a pending task
    Create {
        #[arg(long)]
        id: String,
        #[arg(long)]
        project: String,
        /// Opaque pointer to the task instructions
        #[arg(long, default_value = "")]
        spec: String,
        /// Task id that must complete first (repeatable)
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        working_dir: Option<String>,
        /// KEY=VALUE environment override (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Show a task
    Get { task_id: String },
    /// Show the result record of a finished task
    Result { task_id: String },
    /// List tasks
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// List pending tasks whose dependencies are complete
    Poll {
        #[arg(long)]
        project: Option<String>,
    },
    /// Claim a pending task for a node
    Claim {
        task_id: String,
        #[arg(long)]
        node: String,
    },
    /// Renew a node's lease on a task
    Heartbeat {
        task_id: String,
        #[arg(long)]
        node: String,
    },
    /// Record the final status of a task
    Finish {
        task_id: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        status: TaskStatus,
        #[arg(long)]
        error: Option<String>,
        /// Read the canonical result record from stdin
        #[arg(long)]
        result_stdin: bool,
    },
    /// Return tasks with expired leases to PENDING
    Reap,
}

/// Route a command to its handler
pub async fn handle_command(
    command: Commands,
    database_url: &str,
    lease_timeout: Duration,
) -> Result<()> {
    let pool = db::create_pool(database_url)
        .await
        .context("Failed to create database pool")?;

    match command {
        Commands::Serve {
            bind,
            reap_interval,
        } => serve(pool, &bind, lease_timeout, Duration::from_secs(reap_interval)).await,
        Commands::Migrate => {
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            print_json(&serde_json::json!({ "migrated": true }))
        }
        Commands::Create {
            id,
            project,
            spec,
            dependencies,
            command,
            working_dir,
            env,
            timeout_secs,
        } => {
            let req = CreateTask {
                id,
                project,
                spec_reference: spec,
                dependencies,
                command,
                working_dir,
                env: env.into_iter().collect::<HashMap<_, _>>(),
                timeout_secs,
            };
            let task = task_service::create_task(&pool, req).await?;
            print_json(&task)
        }
        Commands::Get { task_id } => {
            let task = task_service::get_task(&pool, &task_id).await?;
            print_json(&task)
        }
        Commands::Result { task_id } => {
            let result = task_service::get_result(&pool, &task_id).await?;
            print_json(&result)
        }
        Commands::List { project, status } => {
            let tasks = task_service::list_tasks(&pool, &TaskQuery { project, status }).await?;
            print_json(&tasks)
        }
        Commands::Poll { project } => {
            let tasks = task_service::eligible_tasks(&pool, project.as_deref()).await?;
            print_json(&tasks)
        }
        Commands::Claim { task_id, node } => {
            let claimed = task_service::claim_task(&pool, &task_id, &node).await?;
            print_json(&ClaimResponse { claimed })
        }
        Commands::Heartbeat { task_id, node } => {
            task_service::heartbeat(&pool, &task_id, &node).await?;
            print_json(&serde_json::json!({ "ok": true }))
        }
        Commands::Finish {
            task_id,
            node,
            status,
            error,
            result_stdin,
        } => {
            let result = if result_stdin {
                Some(read_result_from_stdin()?)
            } else {
                None
            };
            task_service::finish_task(&pool, &task_id, &node, status, error, result).await?;
            print_json(&serde_json::json!({ "ok": true }))
        }
        Commands::Reap => {
            let reaped = task_service::reap_expired_leases(&pool, lease_timeout).await?;
            print_json(&ReapResponse { reaped })
        }
    }
}

async fn serve(
    pool: PgPool,
    bind: &str,
    lease_timeout: Duration,
    reap_interval: Duration,
) -> Result<()> {
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let reaper = task_service::spawn_reaper(pool.clone(), lease_timeout, reap_interval);
    tracing::info!(
        "Lease reaper started (lease timeout {:?}, interval {:?})",
        lease_timeout,
        reap_interval
    );

    let app = api::create_router(AppState {
        pool,
        lease_timeout,
    });

    tracing::info!("Listening on {}", bind);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    tracing::info!("Coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn read_result_from_stdin() -> Result<TaskResult> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read result record from stdin")?;

    serde_json::from_str(input.trim()).context("Invalid result record on stdin")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to serialize output")?;
    println!("{}", line);
    Ok(())
}

fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
