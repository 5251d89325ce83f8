//! Filesystem task store
//!
//! Tasks live in a directory tree shared by every node:
//!
//! ```text
//! <root>/<project>/tasks/<task_id>/status.json   task record
//! <root>/<project>/tasks/<task_id>/result.json   canonical result, once finished
//! <root>/<project>/tasks/<task_id>/.lock         flock target
//! ```
//!
//! Every read-modify-write of `status.json` happens under an exclusive `flock`
//! on the task's lock file and lands through an atomic rename, so a claim is a
//! compare-and-set even with many nodes on the same tree. Fields this store
//! does not know about are carried through untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};
use taskpool_core::protocol::head_chars;
use tracing::{debug, info, warn};

use super::{Result, StoreError, TaskStore};

const STATUS_FILE: &str = "status.json";
const RESULT_FILE: &str = "result.json";
const LOCK_FILE: &str = ".lock";
const TASKS_DIR: &str = "tasks";

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Longest error message written into a status file
const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    node_id: String,
    lease_timeout: chrono::Duration,
}

/// Every task found under the scanned projects, plus which dependencies are met
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    completed: HashSet<TaskKey>,
}

impl Snapshot {
    /// Dependencies name a task in the same project, or `project/id` elsewhere
    pub fn dependency_key(task: &Task, dependency: &str) -> TaskKey {
        match dependency.split_once('/') {
            Some((project, id)) => TaskKey::new(project, id),
            None => TaskKey::new(&task.project, dependency),
        }
    }

    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.completed.contains(&Self::dependency_key(task, dep)))
    }

    /// Claimable tasks (pending, or under an expired lease) with dependencies met
    pub fn eligible(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.is_claimable(now, lease_timeout) && self.dependencies_satisfied(t))
            .cloned()
            .collect()
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, node_id: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            node_id: node_id.into(),
            lease_timeout: chrono::Duration::from_std(lease_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        self.lease_timeout
    }

    fn task_dir(&self, key: &TaskKey) -> PathBuf {
        self.root.join(&key.project).join(TASKS_DIR).join(&key.id)
    }

    /// Read every task under `project` (or all projects)
    pub async fn scan(&self, project: Option<&str>) -> Result<Snapshot> {
        let project = project.map(str::to_string);
        self.blocking(move |store| store.scan_blocking(project.as_deref()))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&FileStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::io(root, io::Error::other(e)))?
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    fn scan_blocking(&self, project: Option<&str>) -> Result<Snapshot> {
        let projects = match project {
            Some(project) => vec![project.to_string()],
            None => self.list_projects()?,
        };

        let mut tasks = Vec::new();
        for project in &projects {
            tasks.extend(self.load_project(project)?);
        }

        let known: HashSet<TaskKey> = tasks.iter().map(Task::key).collect();
        let mut completed: HashSet<TaskKey> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(Task::key)
            .collect();

        // Dependencies on projects outside this scan are read one by one
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            for dep in &task.dependencies {
                let key = Snapshot::dependency_key(task, dep);
                if known.contains(&key) || completed.contains(&key) {
                    continue;
                }
                match self.read_task(&key) {
                    Ok(Some(t)) if t.status == TaskStatus::Completed => {
                        completed.insert(key);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cannot read dependency {} of {}: {}", key, task.key(), e),
                }
            }
        }

        Ok(Snapshot { tasks, completed })
    }

    fn list_projects(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Tasks root {} does not exist yet", self.root.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if entry.path().join(TASKS_DIR).is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    projects.push(name.to_string());
                }
            }
        }
        projects.sort();
        Ok(projects)
    }

    fn load_project(&self, project: &str) -> Result<Vec<Task>> {
        let tasks_dir = self.root.join(project).join(TASKS_DIR);
        let entries = match fs::read_dir(&tasks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&tasks_dir, e)),
        };

        let mut tasks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&tasks_dir, e))?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().join(STATUS_FILE).is_file() {
                continue;
            }

            let key = TaskKey::new(project, id);
            match self.read_task(&key) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                // One broken record must not hide the rest of the project
                Err(e) => warn!("Skipping task {}: {}", key, e),
            }
        }

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn read_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        let dir = self.task_dir(key);
        match read_document(&dir.join(STATUS_FILE))? {
            Some(doc) => task_from_document(&doc, key, &dir).map(Some),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Lease operations
    // =========================================================================

    /// Lock the task, load its record and hand both to `update`
    ///
    /// When `update` returns a document it replaces `status.json` atomically.
    fn locked_update<T>(
        &self,
        key: &TaskKey,
        update: impl FnOnce(&mut Map<String, Value>, &Task) -> Result<(T, bool)>,
    ) -> Result<T> {
        let dir = self.task_dir(key);
        let status_path = dir.join(STATUS_FILE);
        if !status_path.is_file() {
            return Err(StoreError::NotFound(key.clone()));
        }

        let _lock = TaskLock::acquire(&dir, LOCK_TIMEOUT)?;

        let mut doc = read_document(&status_path)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let task = task_from_document(&doc, key, &dir)?;

        let (value, changed) = update(&mut doc, &task)?;
        if changed {
            let bytes = serde_json::to_vec_pretty(&Value::Object(doc))
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            write_atomic(&status_path, &bytes)?;
        }

        Ok(value)
    }

    fn claim_blocking(&self, key: &TaskKey) -> Result<bool> {
        let node_id = self.node_id.clone();
        let lease_timeout = self.lease_timeout;

        self.locked_update(key, |doc, task| {
            let now = Utc::now();
            if !task.is_claimable(now, lease_timeout) {
                debug!(
                    "Task {} not claimable (status {}, owner {:?})",
                    key, task.status, task.lease_owner
                );
                return Ok((false, false));
            }

            if task.status.is_active() {
                warn!(
                    "Taking over task {} from node {:?} after its lease expired",
                    key, task.lease_owner
                );
            }

            set_fields(
                doc,
                [
                    ("status", Value::from(TaskStatus::Claimed.as_str())),
                    ("lease_owner", Value::from(node_id.as_str())),
                    ("claimed_at", timestamp(now)),
                    ("heartbeat_at", Value::Null),
                    ("finished_at", Value::Null),
                    ("error", Value::Null),
                ],
            );
            Ok((true, true))
        })
    }

    fn heartbeat_blocking(&self, key: &TaskKey) -> Result<()> {
        let node_id = self.node_id.clone();

        self.locked_update(key, |doc, task| {
            ensure_lease(task, key, &node_id, TaskStatus::Running)?;

            let mut fields = vec![("heartbeat_at", timestamp(Utc::now()))];
            if task.status == TaskStatus::Claimed {
                fields.push(("status", Value::from(TaskStatus::Running.as_str())));
            }
            set_fields(doc, fields);
            Ok(((), true))
        })
    }

    fn finish_blocking(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<String>,
        result: Option<TaskResult>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(StoreError::Decode(format!(
                "Invalid completion status: {}",
                status
            )));
        }

        let node_id = self.node_id.clone();
        let dir = self.task_dir(key);

        self.locked_update(key, |doc, task| {
            ensure_lease(task, key, &node_id, status)?;

            if let Some(result) = &result {
                let bytes = serde_json::to_vec_pretty(result)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                write_atomic(&dir.join(RESULT_FILE), &bytes)?;
            }

            let now = Utc::now();
            set_fields(
                doc,
                [
                    ("status", Value::from(status.as_str())),
                    ("finished_at", timestamp(now)),
                    ("heartbeat_at", timestamp(now)),
                    (
                        "error",
                        error
                            .as_deref()
                            .map(|e| Value::from(head_chars(e, MAX_ERROR_CHARS)))
                            .unwrap_or(Value::Null),
                    ),
                ],
            );
            Ok(((), true))
        })?;

        info!("Task {} marked {}", key, status);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let snapshot = self.scan(project).await?;
        Ok(snapshot.eligible(Utc::now(), self.lease_timeout))
    }

    async fn claim(&self, key: &TaskKey) -> Result<bool> {
        let key = key.clone();
        self.blocking(move |store| store.claim_blocking(&key)).await
    }

    async fn heartbeat(&self, key: &TaskKey) -> Result<()> {
        let key = key.clone();
        self.blocking(move |store| store.heartbeat_blocking(&key))
            .await
    }

    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        let key = key.clone();
        let error = error.map(str::to_string);
        let result = result.cloned();
        self.blocking(move |store| store.finish_blocking(&key, status, error, result))
            .await
    }
}

/// `node_id` holds the lease and the record may move on to `next`
fn ensure_lease(task: &Task, key: &TaskKey, node_id: &str, next: TaskStatus) -> Result<()> {
    let allowed = task.status == next || task.status.can_transition_to(next);
    if task.status.is_active() && task.is_leased_by(node_id) && allowed {
        Ok(())
    } else {
        Err(StoreError::LeaseLost(key.clone()))
    }
}

// =============================================================================
// Status documents
// =============================================================================

fn read_document(path: &Path) -> Result<Option<Map<String, Value>>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match serde_json::from_slice(&raw) {
        Ok(Value::Object(doc)) => Ok(Some(doc)),
        Ok(_) => Err(StoreError::Decode(format!(
            "{} is not a JSON object",
            path.display()
        ))),
        Err(e) => Err(StoreError::Decode(format!("{}: {}", path.display(), e))),
    }
}

/// Build a task from its status document
///
/// The directory is authoritative for `id` and `project`. Status is read
/// leniently; missing or unrecognised values count as `PENDING`. The working
/// directory defaults to the task directory.
fn task_from_document(doc: &Map<String, Value>, key: &TaskKey, dir: &Path) -> Result<Task> {
    let mut doc = doc.clone();
    let dir_str = dir.display().to_string();

    doc.insert("id".to_string(), Value::from(key.id.as_str()));
    doc.insert("project".to_string(), Value::from(key.project.as_str()));

    let status = match doc.get("status") {
        Some(Value::String(s)) => TaskStatus::parse_lenient(s).unwrap_or_else(|| {
            warn!("Task {} has unknown status '{}', treating it as PENDING", key, s);
            TaskStatus::Pending
        }),
        _ => TaskStatus::Pending,
    };
    doc.insert("status".to_string(), Value::from(status.as_str()));

    if matches!(doc.get("spec_reference"), None | Some(Value::Null)) {
        doc.insert("spec_reference".to_string(), Value::from(dir_str.as_str()));
    }
    if matches!(doc.get("working_dir"), None | Some(Value::Null)) {
        doc.insert("working_dir".to_string(), Value::from(dir_str.as_str()));
    }
    // Both spellings present would be a duplicate field
    if doc.contains_key("lease_owner") {
        doc.remove("claimed_by");
    }

    serde_json::from_value(Value::Object(doc))
        .map_err(|e| StoreError::Decode(format!("{}: {}", key, e)))
}

fn set_fields<'a>(doc: &mut Map<String, Value>, fields: impl IntoIterator<Item = (&'a str, Value)>) {
    doc.remove("claimed_by");
    for (name, value) in fields {
        doc.insert(name.to_string(), value);
    }
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::from(at.to_rfc3339())
}

/// Write through a temporary sibling and rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(&tmp_path, e))?;

    fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))
}

// =============================================================================
// Locking
// =============================================================================

/// Exclusive `flock` on a task's lock file, released on drop
///
/// The lock file is never removed: a waiter may already hold it open.
#[derive(Debug)]
struct TaskLock {
    file: File,
}

impl TaskLock {
    fn acquire(dir: &Path, timeout: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let fd = file.as_raw_fd();
        let deadline = Instant::now() + timeout;

        loop {
            // SAFETY: fd belongs to `file`, which outlives this call
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                return Ok(Self { file });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(StoreError::io(&path, err));
            }

            if Instant::now() >= deadline {
                return Err(StoreError::io(
                    &path,
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("timed out acquiring lock after {:?}", timeout),
                    ),
                ));
            }

            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(90);

    fn write_status(root: &Path, project: &str, id: &str, doc: Value) -> PathBuf {
        let dir = root.join(project).join(TASKS_DIR).join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STATUS_FILE), serde_json::to_vec(&doc).unwrap()).unwrap();
        dir
    }

    fn read_status(dir: &Path) -> Value {
        serde_json::from_slice(&fs::read(dir.join(STATUS_FILE)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_scan_fills_identity_from_path() {
        let root = TempDir::new().unwrap();
        let dir = write_status(root.path(), "web", "T1", json!({"status": "pending", "command": "true"}));

        let store = FileStore::new(root.path(), "node-a", LEASE);
        let snapshot = store.scan(None).await.unwrap();

        assert_eq!(snapshot.tasks.len(), 1);
        let task = &snapshot.tasks[0];
        assert_eq!(task.id, "T1");
        assert_eq!(task.project, "web");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.working_dir.as_deref(), Some(dir.display().to_string().as_str()));
    }

    #[tokio::test]
    async fn test_missing_root_polls_empty() {
        let root = TempDir::new().unwrap();
        let store = FileStore::new(root.path().join("nope"), "node-a", LEASE);
        assert!(store.poll(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_record_is_skipped() {
        let root = TempDir::new().unwrap();
        write_status(root.path(), "web", "T1", json!({"status": "PENDING"}));
        let broken = root.path().join("web/tasks/T2");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(STATUS_FILE), b"{not json").unwrap();

        let store = FileStore::new(root.path(), "node-a", LEASE);
        let eligible = store.poll(Some("web")).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "T1");
    }

    #[tokio::test]
    async fn test_status_synonyms_and_unknown_values() {
        let root = TempDir::new().unwrap();
        write_status(root.path(), "web", "A", json!({"status": "done"}));
        write_status(root.path(), "web", "B", json!({"status": "pending", "dependencies": ["A"]}));
        write_status(root.path(), "web", "C", json!({"status": "in_progress", "lease_owner": "node-b", "heartbeat_at": Utc::now().to_rfc3339()}));
        write_status(root.path(), "web", "D", json!({"status": "whatever"}));
        write_status(root.path(), "web", "E", json!({"status": 7}));

        let store = FileStore::new(root.path(), "node-a", LEASE);
        let snapshot = store.scan(Some("web")).await.unwrap();
        let status = |id: &str| snapshot.tasks.iter().find(|t| t.id == id).unwrap().status;

        assert_eq!(snapshot.tasks.len(), 5);
        assert_eq!(status("A"), TaskStatus::Completed);
        assert_eq!(status("C"), TaskStatus::Running);
        assert_eq!(status("D"), TaskStatus::Pending);
        assert_eq!(status("E"), TaskStatus::Pending);

        let mut ids: Vec<String> = store
            .poll(Some("web"))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["B", "D", "E"]);
    }

    #[tokio::test]
    async fn test_poll_respects_dependencies() {
        let root = TempDir::new().unwrap();
        write_status(root.path(), "web", "A", json!({"status": "COMPLETED"}));
        write_status(root.path(), "web", "B", json!({"status": "PENDING", "dependencies": ["A"]}));
        write_status(root.path(), "web", "C", json!({"status": "PENDING", "dependencies": ["B"]}));
        write_status(root.path(), "lib", "L", json!({"status": "COMPLETED"}));
        write_status(root.path(), "web", "D", json!({"status": "PENDING", "dependencies": ["lib/L"]}));

        let store = FileStore::new(root.path(), "node-a", LEASE);
        let mut ids: Vec<String> = store
            .poll(Some("web"))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();

        assert_eq!(ids, vec!["B", "D"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let root = TempDir::new().unwrap();
        write_status(root.path(), "web", "T1", json!({"status": "PENDING"}));
        let key = TaskKey::new("web", "T1");

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::new(FileStore::new(root.path(), format!("node-{}", i), LEASE));
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.claim(&key).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_then_heartbeat_then_finish() {
        let root = TempDir::new().unwrap();
        let dir = write_status(
            root.path(),
            "web",
            "T1",
            json!({"status": "PENDING", "owner_team": "infra"}),
        );
        let key = TaskKey::new("web", "T1");
        let store = FileStore::new(root.path(), "node-a", LEASE);

        assert!(store.claim(&key).await.unwrap());
        let doc = read_status(&dir);
        assert_eq!(doc["status"], "CLAIMED");
        assert_eq!(doc["lease_owner"], "node-a");

        store.heartbeat(&key).await.unwrap();
        assert_eq!(read_status(&dir)["status"], "RUNNING");

        let result = TaskResult::completed("T1");
        store
            .finish(&key, TaskStatus::Completed, None, Some(&result))
            .await
            .unwrap();

        let doc = read_status(&dir);
        assert_eq!(doc["status"], "COMPLETED");
        assert!(doc["finished_at"].is_string());
        // Unknown fields survive every rewrite
        assert_eq!(doc["owner_team"], "infra");

        let saved: TaskResult =
            serde_json::from_slice(&fs::read(dir.join(RESULT_FILE)).unwrap()).unwrap();
        assert!(saved.ok);

        // Terminal tasks are not offered again
        assert!(store.poll(Some("web")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_lease_is_respected() {
        let root = TempDir::new().unwrap();
        write_status(
            root.path(),
            "web",
            "T1",
            json!({"status": "RUNNING", "claimed_by": "node-b", "heartbeat_at": Utc::now().to_rfc3339()}),
        );
        let key = TaskKey::new("web", "T1");
        let store = FileStore::new(root.path(), "node-a", LEASE);

        assert!(store.poll(None).await.unwrap().is_empty());
        assert!(!store.claim(&key).await.unwrap());
        assert!(matches!(
            store.heartbeat(&key).await,
            Err(StoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store.finish(&key, TaskStatus::Failed, Some("x"), None).await,
            Err(StoreError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let root = TempDir::new().unwrap();
        let stale = Utc::now() - chrono::Duration::seconds(600);
        let dir = write_status(
            root.path(),
            "web",
            "T1",
            json!({"status": "RUNNING", "claimed_by": "node-b", "heartbeat_at": stale.to_rfc3339()}),
        );
        let key = TaskKey::new("web", "T1");
        let store = FileStore::new(root.path(), "node-a", LEASE);

        assert_eq!(store.poll(None).await.unwrap().len(), 1);
        assert!(store.claim(&key).await.unwrap());

        let doc = read_status(&dir);
        assert_eq!(doc["lease_owner"], "node-a");
        assert!(doc.get("claimed_by").is_none());
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let root = TempDir::new().unwrap();
        let store = FileStore::new(root.path(), "node-a", LEASE);
        let key = TaskKey::new("web", "ghost");

        assert!(matches!(store.claim(&key).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.heartbeat(&key).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_finish_truncates_error() {
        let root = TempDir::new().unwrap();
        let dir = write_status(root.path(), "web", "T1", json!({"status": "PENDING"}));
        let key = TaskKey::new("web", "T1");
        let store = FileStore::new(root.path(), "node-a", LEASE);

        assert!(store.claim(&key).await.unwrap());
        let long_error = "e".repeat(5000);
        store
            .finish(&key, TaskStatus::Failed, Some(&long_error), None)
            .await
            .unwrap();

        let doc = read_status(&dir);
        assert_eq!(doc["status"], "FAILED");
        assert_eq!(doc["error"].as_str().unwrap().len(), MAX_ERROR_CHARS);
        assert!(!dir.join(RESULT_FILE).exists());
    }
}
