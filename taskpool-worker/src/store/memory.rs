//! In-memory task store for scheduler tests

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};

use super::{Result, StoreError, TaskStore};

#[derive(Debug, Clone)]
pub struct Finished {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
}

#[derive(Default)]
pub struct MemoryStore {
    node_id: String,
    tasks: Mutex<HashMap<TaskKey, Task>>,
    finished: Mutex<HashMap<TaskKey, Finished>>,
    /// Claims that lose as if another node got there first
    rigged: Mutex<HashSet<TaskKey>>,
    /// Claims that fail as if the store were unreachable
    broken_claims: Mutex<HashSet<TaskKey>>,
    /// Tasks whose every heartbeat reports the lease gone
    revoked: Mutex<HashSet<TaskKey>>,
    failing_polls: AtomicUsize,
    pub polls: AtomicUsize,
    pub heartbeats: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl MemoryStore {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskKey, Task>> {
        self.tasks.lock().unwrap()
    }

    pub fn add(&self, task: Task) {
        self.tasks().insert(task.key(), task);
    }

    pub fn lose_claim(&self, key: TaskKey) {
        self.rigged.lock().unwrap().insert(key);
    }

    pub fn break_claim(&self, key: TaskKey) {
        self.broken_claims.lock().unwrap().insert(key);
    }

    /// Heartbeats for `key` fail with a lost lease from the first one on
    pub fn revoke(&self, key: TaskKey) {
        self.revoked.lock().unwrap().insert(key);
    }

    /// The next `count` polls fail
    pub fn fail_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Hand the lease on `key` to another node
    pub fn steal(&self, key: &TaskKey) {
        if let Some(task) = self.tasks().get_mut(key) {
            task.lease_owner = Some("thief".to_string());
        }
    }

    pub fn status(&self, key: &TaskKey) -> Option<TaskStatus> {
        self.tasks().get(key).map(|t| t.status)
    }

    pub fn finished(&self, key: &TaskKey) -> Option<Finished> {
        self.finished.lock().unwrap().get(key).cloned()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Command("store unavailable".to_string()));
        }

        let tasks = self.tasks();
        let completed: HashSet<String> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();

        let mut eligible: Vec<Task> = tasks
            .values()
            .filter(|t| project.is_none_or(|p| t.project == p))
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|dep| completed.contains(dep)))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(eligible)
    }

    async fn claim(&self, key: &TaskKey) -> Result<bool> {
        if self.rigged.lock().unwrap().contains(key) {
            return Ok(false);
        }
        if self.broken_claims.lock().unwrap().contains(key) {
            return Err(StoreError::Command("store unavailable".to_string()));
        }

        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }

        task.status = TaskStatus::Claimed;
        task.lease_owner = Some(self.node_id.clone());
        task.claimed_at = Some(Utc::now());

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        Ok(true)
    }

    async fn heartbeat(&self, key: &TaskKey) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.revoked.lock().unwrap().contains(key) {
            return Err(StoreError::LeaseLost(key.clone()));
        }

        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if !task.status.is_active() || !task.is_leased_by(&self.node_id) {
            return Err(StoreError::LeaseLost(key.clone()));
        }

        task.status = TaskStatus::Running;
        task.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        {
            let mut tasks = self.tasks();
            let task = tasks
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if !task.status.is_active() || !task.is_leased_by(&self.node_id) {
                return Err(StoreError::LeaseLost(key.clone()));
            }
            task.status = status;
            task.error = error.map(str::to_string);
            task.finished_at = Some(Utc::now());
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().unwrap().insert(
            key.clone(),
            Finished {
                status,
                error: error.map(str::to_string),
                result: result.cloned(),
            },
        );
        Ok(())
    }
}
