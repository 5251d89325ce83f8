//! Taskpool Worker
//!
//! A worker node that pulls tasks from a shared store and runs them as local
//! shell commands.
//!
//! Architecture:
//! - Configuration: node identity, store backend and limits from the environment
//! - Stores: coordinator HTTP API, coordinator executable, or shared files
//! - Runner: process-group execution with timeouts and output normalization
//! - Scheduler: polling, claiming, heartbeats and result reporting
//!
//! The node claims up to its slot budget, heartbeats while tasks run, and
//! reports one canonical result per task. SIGINT/SIGTERM stop it cleanly.

mod config;
mod runner;
mod scheduler;
mod shutdown;
mod store;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use taskpool_client::CoordinatorClient;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreBackend};
use crate::runner::TaskRunner;
use crate::scheduler::{TaskPoller, TaskWatcher};
use crate::store::{CliStore, FileStore, HttpStore, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskpool_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Taskpool Worker");

    let config = load_config()?;
    info!(
        "Loaded configuration: node_id={}, backend={:?}, slots={}",
        config.node_id, config.backend, config.max_slots
    );

    let store = build_store(&config).await?;
    let runner = Arc::new(TaskRunner::new(config.kill_grace));
    let shutdown = shutdown::install_shutdown_handler()?;

    info!(
        "Poll interval: {:?}, heartbeat interval: {:?}, default timeout: {:?}",
        config.poll_interval, config.heartbeat_interval, config.task_timeout
    );

    let poller = TaskPoller::new(config, store, runner, shutdown);

    if let Err(e) = poller.run().await {
        error!("Poller error: {:#}", e);
        return Err(e);
    }

    info!("Worker stopped");
    Ok(())
}

fn load_config() -> Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;
    Ok(config)
}

async fn build_store(config: &Config) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match config.backend {
        StoreBackend::Http => {
            let client = CoordinatorClient::new(config.coordinator_url.clone());
            wait_for_coordinator(&client).await?;
            info!("Connected to coordinator at {}", client.base_url());
            Arc::new(HttpStore::new(client, config.node_id.clone()))
        }
        StoreBackend::Cli => {
            info!(
                "Using coordinator executable {}",
                config.coordinator_bin.display()
            );
            Arc::new(
                CliStore::new(config.coordinator_bin.clone(), config.node_id.clone())
                    .with_args(config.coordinator_args.clone()),
            )
        }
        StoreBackend::Fs => {
            info!("Watching task files under {}", config.tasks_root.display());
            let files = FileStore::new(
                config.tasks_root.clone(),
                config.node_id.clone(),
                config.lease_timeout,
            );
            Arc::new(TaskWatcher::new(files, config.seen_capacity))
        }
    };

    Ok(store)
}

/// Wait for the coordinator to answer its health check, with exponential backoff
///
/// The coordinator may not be up yet when the node starts (common in
/// container environments).
async fn wait_for_coordinator(client: &CoordinatorClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.health().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Coordinator reachable after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Coordinator unreachable after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!(
                        "Coordinator at {} is unreachable: {}",
                        client.base_url(),
                        e
                    ));
                }

                warn!(
                    "Coordinator not reachable (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
