//! Task watcher
//!
//! Filesystem flavour of the scheduler's store: wraps [`FileStore`] and
//! remembers which `project/task_id` keys need no further attention, so the
//! node stops re-evaluating finished work and work other nodes are doing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};
use tracing::debug;

use crate::store::{FileStore, Result, TaskStore};

/// Insertion-ordered set that forgets its oldest half when over capacity
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns `false` if the key was already present
    pub fn insert(&mut self, key: String) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);

        if self.keys.len() > self.capacity {
            let evict = self.keys.len() / 2;
            for old in self.order.drain(..evict) {
                self.keys.remove(&old);
            }
            debug!("Seen set over capacity, forgot {} oldest key(s)", evict);
        }
        true
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

pub struct TaskWatcher {
    store: FileStore,
    seen: Mutex<SeenSet>,
}

impl TaskWatcher {
    pub fn new(store: FileStore, seen_capacity: usize) -> Self {
        Self {
            store,
            seen: Mutex::new(SeenSet::new(seen_capacity)),
        }
    }

    fn seen(&self) -> MutexGuard<'_, SeenSet> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn seen_count(&self) -> usize {
        self.seen().len()
    }
}

#[async_trait]
impl TaskStore for TaskWatcher {
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let snapshot = self.store.scan(project).await?;
        let now = Utc::now();
        let lease_timeout = self.store.lease_timeout();
        let node_id = self.store.node_id();

        let mut seen = self.seen();
        let mut skipped = 0usize;

        for task in &snapshot.tasks {
            let key = task.key().to_string();
            let stale = task.lease_is_stale(now, lease_timeout);

            if seen.contains(&key) {
                // A seen task only comes back if its holder went silent
                if stale {
                    seen.remove(&key);
                } else {
                    skipped += 1;
                }
                continue;
            }

            let foreign_live =
                task.status.is_active() && !task.is_leased_by(node_id) && !stale;
            if task.status.is_terminal() || foreign_live {
                seen.insert(key);
                skipped += 1;
            }
        }

        let eligible: Vec<Task> = snapshot
            .eligible(now, lease_timeout)
            .into_iter()
            .filter(|t| !seen.contains(&t.key().to_string()))
            .collect();

        debug!(
            "Scanned {} task(s): {} eligible, {} already handled",
            snapshot.tasks.len(),
            eligible.len(),
            skipped
        );

        Ok(eligible)
    }

    async fn claim(&self, key: &TaskKey) -> Result<bool> {
        self.store.claim(key).await
    }

    async fn heartbeat(&self, key: &TaskKey) -> Result<()> {
        self.store.heartbeat(key).await
    }

    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        self.store.finish(key, status, error, result).await?;
        self.seen().insert(key.to_string());
        Ok(())
    }
}
