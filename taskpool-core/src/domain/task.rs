//! Task domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifies a task within its project namespace
///
/// Task ids are globally unique, but the filesystem layout and the watcher's
/// seen-set are keyed by `project/id`, so both travel together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub project: String,
    pub id: String,
}

impl TaskKey {
    pub fn new(project: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.id)
    }
}

/// A schedulable unit of work
///
/// Created in `Pending` by an external authoring process. Only the node
/// holding the lease mutates it, and terminal states are never left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project: String,

    /// Opaque pointer to the task instructions
    #[serde(default)]
    pub spec_reference: String,

    /// Task ids that must be `Completed` before this task is eligible
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub status: TaskStatus,

    #[serde(default, alias = "claimed_by")]
    pub lease_owner: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Wall-clock budget; the worker default applies when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Shell command, run with `sh -c`
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a pending task with no command or lease
    pub fn pending(project: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            spec_reference: String::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            lease_owner: None,
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
            timeout_secs: None,
            command: None,
            working_dir: None,
            env: HashMap::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.project, &self.id)
    }

    /// Whether the lease is held by `node_id`
    pub fn is_leased_by(&self, node_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(node_id)
    }

    /// Last sign of life from the lease holder
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.claimed_at)
    }

    /// A lease is stale once the holder has been silent for `lease_timeout`
    ///
    /// Only meaningful for `Claimed`/`Running` tasks; anything else is never stale.
    pub fn lease_is_stale(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> bool {
        if !self.status.is_active() {
            return false;
        }

        match self.last_activity() {
            Some(at) => now - at > lease_timeout,
            None => true,
        }
    }

    /// Pending, or active under an expired lease
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> bool {
        self.status == TaskStatus::Pending || self.lease_is_stale(now, lease_timeout)
    }

    pub fn timeout(&self, default: std::time::Duration) -> std::time::Duration {
        self.timeout_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Task lifecycle status
///
/// `Pending → Claimed → Running → {Completed | Failed | Timeout}`. An expired
/// lease sends `Claimed`/`Running` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Held under a lease by some node
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    /// Status as hand-written records spell it
    ///
    /// Accepts the canonical names in any case, with `-` or spaces for `_`,
    /// plus common synonyms (`done`, `in_progress`, `error`, ...). Returns
    /// `None` for anything else.
    pub fn parse_lenient(s: &str) -> Option<TaskStatus> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        if let Ok(status) = normalized.parse() {
            return Some(status);
        }

        let status = match normalized.as_str() {
            "NEW" | "TODO" | "QUEUED" | "READY" | "OPEN" => TaskStatus::Pending,
            "ASSIGNED" | "LEASED" => TaskStatus::Claimed,
            "IN_PROGRESS" | "STARTED" | "ACTIVE" => TaskStatus::Running,
            "DONE" | "COMPLETE" | "SUCCESS" | "SUCCEEDED" | "PASSED" => TaskStatus::Completed,
            "ERROR" | "FAILURE" | "ERRORED" => TaskStatus::Failed,
            "TIMED_OUT" | "EXPIRED" => TaskStatus::Timeout,
            _ => return None,
        };
        Some(status)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Claimed) => true,
            (Claimed, Running) => true,
            (Claimed | Running, Pending) => true,
            (Claimed | Running, Completed | Failed | Timeout) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(status: TaskStatus, heartbeat_secs_ago: i64) -> Task {
        let mut task = Task::pending("proj", "T1");
        task.status = status;
        task.lease_owner = Some("node-a".to_string());
        task.heartbeat_at = Some(Utc::now() - chrono::Duration::seconds(heartbeat_secs_ago));
        task
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("running".parse::<TaskStatus>(), Ok(TaskStatus::Running));
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }

    #[test]
    fn test_state_machine_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Running.can_transition_to(Timeout));
        assert!(Running.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Timeout] {
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_lease_staleness() {
        let lease = chrono::Duration::seconds(90);
        let now = Utc::now();

        assert!(!active(TaskStatus::Running, 10).lease_is_stale(now, lease));
        assert!(active(TaskStatus::Running, 200).lease_is_stale(now, lease));
        assert!(active(TaskStatus::Claimed, 200).is_claimable(now, lease));

        let mut finished = active(TaskStatus::Completed, 200);
        finished.lease_owner = None;
        assert!(!finished.lease_is_stale(now, lease));
        assert!(!finished.is_claimable(now, lease));
    }

    #[test]
    fn test_claimed_without_any_timestamp_is_stale() {
        let mut task = Task::pending("proj", "T1");
        task.status = TaskStatus::Claimed;
        assert!(task.lease_is_stale(Utc::now(), chrono::Duration::seconds(90)));
    }

    #[test]
    fn test_lenient_status_names() {
        assert_eq!(TaskStatus::parse_lenient("running"), Some(TaskStatus::Running));
        assert_eq!(TaskStatus::parse_lenient(" done "), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse_lenient("in-progress"), Some(TaskStatus::Running));
        assert_eq!(TaskStatus::parse_lenient("In Progress"), Some(TaskStatus::Running));
        assert_eq!(TaskStatus::parse_lenient("timed_out"), Some(TaskStatus::Timeout));
        assert_eq!(TaskStatus::parse_lenient("error"), Some(TaskStatus::Failed));
        assert_eq!(TaskStatus::parse_lenient("todo"), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::parse_lenient("bogus"), None);
    }

    #[test]
    fn test_task_deserializes_with_minimal_fields() {
        let task: Task =
            serde_json::from_str(r#"{"id": "T1", "project": "web", "status": "PENDING"}"#)
                .unwrap();

        assert_eq!(task.key(), TaskKey::new("web", "T1"));
        assert!(task.dependencies.is_empty());
        assert!(task.command.is_none());
        assert_eq!(task.key().to_string(), "web/T1");
    }
}
