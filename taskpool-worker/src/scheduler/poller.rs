//! Task poller
//!
//! Polls the task store for eligible work, claims as many tasks as there are
//! free slots, and runs each claimed task in its own tokio task with a
//! heartbeat alongside. Results go back to the store through `finish`.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::runner::{CANCELLED, TaskRunner};
use crate::store::TaskStore;

/// Error recorded on tasks with neither a command nor a command template
pub const NO_COMMAND: &str = "no command";

/// Pause between kill attempts on a task whose process is not registered yet
const KILL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Everything a spawned task execution needs
struct Shared {
    config: Config,
    store: Arc<dyn TaskStore>,
    runner: Arc<TaskRunner>,
    shutdown: CancellationToken,
}

/// Task poller that continuously claims and executes tasks
pub struct TaskPoller {
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
}

impl TaskPoller {
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        runner: Arc<TaskRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_slots));
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                runner,
                shutdown,
            }),
            slots,
        }
    }

    /// Runs the polling loop until shutdown is requested
    ///
    /// On shutdown, running tasks are killed and reported FAILED before this
    /// returns.
    pub async fn run(&self) -> Result<()> {
        let config = &self.shared.config;
        info!(
            "Starting task poller (node {}, {} slot(s), interval {:?})",
            config.node_id, config.max_slots, config.poll_interval
        );

        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Task execution panicked: {}", e);
                }
            }

            match self.poll_once(&mut tasks).await {
                Ok(launched) => {
                    if launched > 0 {
                        info!("Launched {} task(s) this cycle", launched);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }

            for running in self.shared.runner.list_running() {
                debug!(
                    "Task {}/{} running for {:.0}s (timeout {}s)",
                    running.project, running.task_id, running.elapsed_secs, running.timeout_secs
                );
            }

            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                _ = time::sleep(config.poll_interval) => {}
            }
        }

        self.drain(tasks).await;
        info!("Task poller stopped");
        Ok(())
    }

    /// Performs a single poll cycle, returning how many tasks were launched
    pub async fn poll_once(&self, tasks: &mut JoinSet<()>) -> Result<usize> {
        let available = self.slots.available_permits();
        if available == 0 {
            debug!("All {} slot(s) busy", self.shared.config.max_slots);
            return Ok(0);
        }

        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            debug!("No eligible tasks");
            return Ok(0);
        }

        debug!(
            "{} eligible task(s), {} free slot(s)",
            candidates.len(),
            available
        );

        let mut launched = 0;

        for task in candidates {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!("No free slots left this cycle");
                break;
            };

            let key = task.key();
            match self.shared.store.claim(&key).await {
                Ok(true) => {
                    info!("Claimed task {}", key);
                    tasks.spawn(execute_task(Arc::clone(&self.shared), task, permit));
                    launched += 1;
                }
                Ok(false) => {
                    debug!("Task {} was claimed by another node", key);
                }
                Err(e) => {
                    warn!("Failed to claim task {}: {}", key, e);
                }
            }
        }

        Ok(launched)
    }

    async fn candidates(&self) -> Result<Vec<Task>> {
        let config = &self.shared.config;

        if config.projects.is_empty() {
            return self
                .shared
                .store
                .poll(None)
                .await
                .context("Failed to poll task store");
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for project in &config.projects {
            match self.shared.store.poll(Some(project)).await {
                Ok(tasks) => candidates.extend(tasks.into_iter().filter(|t| seen.insert(t.key()))),
                Err(e) => warn!("Failed to poll project {}: {}", project, e),
            }
        }

        Ok(candidates)
    }

    /// Kill what is still running and wait for every execution to report
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(
            "Shutting down: cancelling {} running task(s)",
            self.shared.runner.running_count()
        );

        let retry = self.shared.config.kill_grace.max(Duration::from_millis(100));

        while !tasks.is_empty() {
            // Executions claimed just before shutdown may start late
            self.shared.runner.kill_all().await;

            tokio::select! {
                joined = tasks.join_next() => {
                    if let Some(Err(e)) = joined {
                        error!("Task execution panicked: {}", e);
                    }
                }
                _ = time::sleep(retry) => {}
            }
        }
    }
}

/// Runs one claimed task; the slot is released when `_permit` drops
async fn execute_task(shared: Arc<Shared>, task: Task, _permit: OwnedSemaphorePermit) {
    let key = task.key();
    let config = &shared.config;

    let Some(command) = resolve_command(&task, config.command_template.as_deref()) else {
        warn!("Task {} has no command and no template is configured", key);
        report(&shared, &key, &TaskResult::failed(&task.id, NO_COMMAND)).await;
        return;
    };

    if shared.shutdown.is_cancelled() {
        report(&shared, &key, &TaskResult::failed(&task.id, CANCELLED)).await;
        return;
    }

    let env = task_env(&task, &config.node_id);
    let timeout = task.timeout(config.task_timeout);
    let working_dir = task.working_dir.as_deref().map(Path::new);

    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat = spawn_heartbeat(Arc::clone(&shared), key.clone(), Arc::clone(&lease_lost));

    let result = shared
        .runner
        .execute(&key, &command, working_dir, &env, timeout, &config.node_id)
        .await;

    heartbeat.abort();

    if lease_lost.load(Ordering::SeqCst) {
        warn!(
            "Discarding result of task {}: this node no longer holds its lease",
            key
        );
        return;
    }

    report(&shared, &key, &result).await;
}

/// Renews the lease every heartbeat interval until aborted
///
/// Losing the lease kills the local process, retrying until it has been
/// registered; the abort on completion ends the retries.
fn spawn_heartbeat(
    shared: Arc<Shared>,
    key: TaskKey,
    lease_lost: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(shared.config.heartbeat_interval);

        loop {
            ticker.tick().await;

            match shared.store.heartbeat(&key).await {
                Ok(()) => debug!("Heartbeat sent for task {}", key),
                Err(e) if e.is_permanent() => {
                    warn!("Lost lease on task {} ({}), killing it", key, e);
                    lease_lost.store(true, Ordering::SeqCst);
                    while !shared.runner.kill(&key).await {
                        time::sleep(KILL_RETRY_DELAY).await;
                    }
                    return;
                }
                Err(e) => warn!("Failed to send heartbeat for task {}: {}", key, e),
            }
        }
    })
}

/// Report a result through `finish`, retrying transient store failures
///
/// Uses exponential backoff; gives up at once if the lease is gone.
async fn report(shared: &Shared, key: &TaskKey, result: &TaskResult) -> bool {
    const MAX_ATTEMPTS: u32 = 5;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 10_000;

    let status = result.final_status();
    let error = if result.ok {
        None
    } else {
        Some(
            result
                .error
                .clone()
                .unwrap_or_else(|| result.status.to_string()),
        )
    };

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match shared
            .store
            .finish(key, status, error.as_deref(), Some(result))
            .await
        {
            Ok(()) => {
                info!("Task {} reported as {}", key, status);
                return true;
            }
            Err(e) if e.is_permanent() => {
                warn!("Could not report task {}: {}", key, e);
                return false;
            }
            Err(e) => {
                if attempt >= MAX_ATTEMPTS {
                    error!(
                        "Giving up reporting task {} after {} attempts: {}",
                        key, MAX_ATTEMPTS, e
                    );
                    return false;
                }

                warn!(
                    "Failed to report task {} (attempt {}/{}): {}",
                    key, attempt, MAX_ATTEMPTS, e
                );

                time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

/// The task's own command, else the configured template filled in
fn resolve_command(task: &Task, template: Option<&str>) -> Option<String> {
    if let Some(command) = task.command.as_deref().filter(|c| !c.trim().is_empty()) {
        return Some(command.to_string());
    }

    template.map(|t| {
        t.replace("{task_id}", &task.id)
            .replace("{project}", &task.project)
            .replace("{spec}", &task.spec_reference)
    })
}

/// Task environment plus the variables identifying the task to the process
fn task_env(task: &Task, node_id: &str) -> HashMap<String, String> {
    let mut env = task.env.clone();
    env.insert("TASKPOOL_TASK_ID".to_string(), task.id.clone());
    env.insert("TASKPOOL_PROJECT".to_string(), task.project.clone());
    env.insert("TASKPOOL_NODE_ID".to_string(), node_id.to_string());
    env.insert("TASKPOOL_SPEC".to_string(), task.spec_reference.clone());
    env
}
