//! Registry of running task processes
//!
//! Entries are keyed by `project/id` and removed by a guard when execution
//! ends, whichever way it ends. A generation number keeps a late guard from
//! removing a newer entry for the same key.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use taskpool_core::domain::task::TaskKey;

#[derive(Debug)]
struct Entry {
    generation: u64,
    pgid: i32,
    lease_owner: String,
    started_at: Instant,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

/// What a kill request needs to reach a running task
#[derive(Debug, Clone)]
pub struct KillHandle {
    pub pgid: i32,
    pub cancelled: Arc<AtomicBool>,
    generation: u64,
}

/// Snapshot of one running task
#[derive(Debug, Clone, Serialize)]
pub struct RunningTaskInfo {
    pub project: String,
    pub task_id: String,
    pub pgid: i32,
    pub lease_owner: String,
    pub elapsed_secs: f64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<TaskKey, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a started process; the entry lives as long as the guard
    pub fn register(
        &self,
        key: &TaskKey,
        pgid: i32,
        lease_owner: &str,
        timeout: Duration,
    ) -> RegistrationGuard {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));

        self.lock().insert(
            key.clone(),
            Entry {
                generation,
                pgid,
                lease_owner: lease_owner.to_string(),
                started_at: Instant::now(),
                timeout,
                cancelled: Arc::clone(&cancelled),
            },
        );

        RegistrationGuard {
            registry: self.clone(),
            key: key.clone(),
            generation,
            cancelled,
        }
    }

    pub fn kill_handle(&self, key: &TaskKey) -> Option<KillHandle> {
        self.lock().get(key).map(|entry| KillHandle {
            pgid: entry.pgid,
            cancelled: Arc::clone(&entry.cancelled),
            generation: entry.generation,
        })
    }

    /// Whether the process a handle was taken from is still registered
    pub fn is_current(&self, key: &TaskKey, handle: &KillHandle) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|entry| entry.generation == handle.generation)
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<RunningTaskInfo> {
        let mut running: Vec<RunningTaskInfo> = self
            .lock()
            .iter()
            .map(|(key, entry)| RunningTaskInfo {
                project: key.project.clone(),
                task_id: key.id.clone(),
                pgid: entry.pgid,
                lease_owner: entry.lease_owner.clone(),
                elapsed_secs: entry.started_at.elapsed().as_secs_f64(),
                timeout_secs: entry.timeout.as_secs(),
            })
            .collect();
        running.sort_by(|a, b| {
            (&a.project, &a.task_id).cmp(&(&b.project, &b.task_id))
        });
        running
    }

    fn remove(&self, key: &TaskKey, generation: u64) {
        let mut entries = self.lock();
        if entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(key);
        }
    }
}

/// Removes its registry entry on drop
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Registry,
    key: TaskKey,
    generation: u64,
    cancelled: Arc<AtomicBool>,
}

impl RegistrationGuard {
    /// Whether a kill request arrived for this process
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> TaskKey {
        TaskKey::new("web", id)
    }

    #[test]
    fn test_guard_removes_entry() {
        let registry = Registry::new();
        {
            let _guard = registry.register(&key("T1"), 4242, "node-a", Duration::from_secs(10));
            assert_eq!(registry.count(), 1);
            assert_eq!(registry.kill_handle(&key("T1")).unwrap().pgid, 4242);
        }
        assert_eq!(registry.count(), 0);
        assert!(registry.kill_handle(&key("T1")).is_none());
    }

    #[test]
    fn test_stale_guard_keeps_newer_entry() {
        let registry = Registry::new();
        let old = registry.register(&key("T1"), 100, "node-a", Duration::from_secs(10));
        let _new = registry.register(&key("T1"), 200, "node-a", Duration::from_secs(10));

        drop(old);
        assert_eq!(registry.kill_handle(&key("T1")).unwrap().pgid, 200);
    }

    #[test]
    fn test_cancel_flag_reaches_guard() {
        let registry = Registry::new();
        let guard = registry.register(&key("T1"), 100, "node-a", Duration::from_secs(10));
        assert!(!guard.was_cancelled());

        let handle = registry.kill_handle(&key("T1")).unwrap();
        handle.cancelled.store(true, Ordering::SeqCst);
        assert!(guard.was_cancelled());
        assert!(registry.is_current(&key("T1"), &handle));

        drop(guard);
        assert!(!registry.is_current(&key("T1"), &handle));
    }

    #[test]
    fn test_snapshot() {
        let registry = Registry::new();
        let _b = registry.register(&key("b"), 2, "node-a", Duration::from_secs(5));
        let _a = registry.register(&key("a"), 1, "node-a", Duration::from_secs(7));

        let running = registry.snapshot();
        assert_eq!(running.len(), 2);
        assert_eq!(running[0].task_id, "a");
        assert_eq!(running[0].timeout_secs, 7);
        assert_eq!(running[1].lease_owner, "node-a");
    }

    #[test]
    fn test_same_id_in_two_projects() {
        let registry = Registry::new();
        let web = TaskKey::new("web", "T1");
        let lib = TaskKey::new("lib", "T1");
        let _web_guard = registry.register(&web, 100, "node-a", Duration::from_secs(10));
        let lib_guard = registry.register(&lib, 200, "node-a", Duration::from_secs(10));

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.kill_handle(&web).unwrap().pgid, 100);
        assert_eq!(registry.kill_handle(&lib).unwrap().pgid, 200);

        let running = registry.snapshot();
        assert_eq!(running[0].project, "lib");
        assert_eq!(running[1].project, "web");

        drop(lib_guard);
        assert_eq!(registry.count(), 1);
        assert!(registry.kill_handle(&web).is_some());
    }
}
