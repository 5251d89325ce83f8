//! Task DTOs for coordinator communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::result::TaskResult;
use crate::domain::task::{Task, TaskStatus};

/// Request to create a new pending task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub id: String,
    pub project: String,
    #[serde(default)]
    pub spec_reference: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CreateTask {
    /// Builds the pending task this request describes
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        let mut task = Task::pending(self.project, self.id);
        task.spec_reference = self.spec_reference;
        task.dependencies = self.dependencies;
        task.command = self.command;
        task.working_dir = self.working_dir;
        task.env = self.env;
        task.timeout_secs = self.timeout_secs;
        task.created_at = now;
        task
    }
}

/// Filters for listing tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQuery {
    pub project: Option<String>,
    pub status: Option<TaskStatus>,
}

/// Claim request from a worker node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTask {
    pub node_id: String,
}

/// Outcome of a claim attempt; `false` means another node won the race
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub claimed: bool,
}

/// Lease renewal from the node holding the task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatTask {
    pub node_id: String,
}

/// Final report from the node holding the task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishTask {
    pub node_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

/// Number of expired leases returned to `Pending`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReapResponse {
    pub reaped: u64,
}
