//! Task store layer
//!
//! Every place a node can find and claim work implements [`TaskStore`]: the
//! coordinator's HTTP API, the coordinator executable, or a shared directory
//! tree of per-task status files. The scheduler only sees the trait.

pub mod cli;
pub mod fs;
pub mod http;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use std::path::PathBuf;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};
use thiserror::Error;

pub use cli::CliStore;
pub use fs::FileStore;
pub use http::HttpStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The node no longer holds the lease; the task must not be touched again
    #[error("Lease on task {0} is no longer held by this node")]
    LeaseLost(TaskKey),

    #[error("Task {0} not found")]
    NotFound(TaskKey),

    #[error("Coordinator request failed: {0}")]
    Coordinator(#[from] taskpool_client::ClientError),

    #[error("Coordinator command failed: {0}")]
    Command(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task data: {0}")]
    Decode(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that retrying the same operation cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::LeaseLost(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Shared task store seen by every worker node
///
/// Implementations must make `claim` a compare-and-set: of several nodes
/// claiming the same pending task, exactly one observes `true`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Pending tasks whose dependencies are all completed
    ///
    /// `None` means every project the store knows about.
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>>;

    /// Atomically move a pending task to `Claimed` under this node's lease
    ///
    /// `Ok(false)` means another node won.
    async fn claim(&self, key: &TaskKey) -> Result<bool>;

    /// Renew this node's lease; the first heartbeat also marks the task `Running`
    async fn heartbeat(&self, key: &TaskKey) -> Result<()>;

    /// Record the terminal status (and result record) of a task this node holds
    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_errors() {
        let key = TaskKey::new("web", "T1");
        assert!(StoreError::LeaseLost(key.clone()).is_permanent());
        assert!(StoreError::NotFound(key).is_permanent());
        assert!(!StoreError::Command("exit status 1".to_string()).is_permanent());
    }

    #[test]
    fn test_error_messages() {
        let err = StoreError::LeaseLost(TaskKey::new("web", "T1"));
        assert_eq!(
            err.to_string(),
            "Lease on task web/T1 is no longer held by this node"
        );

        let err = StoreError::io(
            "/tmp/x/status.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/tmp/x/status.json"));
    }
}
