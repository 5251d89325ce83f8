//! Task store backed by the coordinator HTTP API

use async_trait::async_trait;
use taskpool_client::{ClientError, CoordinatorClient};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};
use tracing::debug;

use super::{Result, StoreError, TaskStore};

pub struct HttpStore {
    client: CoordinatorClient,
    node_id: String,
}

impl HttpStore {
    pub fn new(client: CoordinatorClient, node_id: impl Into<String>) -> Self {
        Self {
            client,
            node_id: node_id.into(),
        }
    }
}

/// 409 means the lease moved on, 404 that the task is gone
fn map_error(err: ClientError, key: &TaskKey) -> StoreError {
    if err.is_conflict() {
        StoreError::LeaseLost(key.clone())
    } else if err.is_not_found() {
        StoreError::NotFound(key.clone())
    } else {
        StoreError::Coordinator(err)
    }
}

#[async_trait]
impl TaskStore for HttpStore {
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let tasks = self.client.eligible_tasks(project).await?;
        debug!("Coordinator offered {} eligible task(s)", tasks.len());
        Ok(tasks)
    }

    async fn claim(&self, key: &TaskKey) -> Result<bool> {
        self.client
            .claim_task(&key.id, &self.node_id)
            .await
            .map_err(|e| map_error(e, key))
    }

    async fn heartbeat(&self, key: &TaskKey) -> Result<()> {
        self.client
            .heartbeat(&key.id, &self.node_id)
            .await
            .map_err(|e| map_error(e, key))
    }

    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        self.client
            .finish_task(
                &key.id,
                &self.node_id,
                status,
                error.map(str::to_string),
                result.cloned(),
            )
            .await
            .map_err(|e| map_error(e, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let key = TaskKey::new("web", "T1");

        let err = map_error(ClientError::api_error(409, "lease lost"), &key);
        assert!(matches!(err, StoreError::LeaseLost(k) if k == key));

        let err = map_error(ClientError::api_error(404, "missing"), &key);
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = map_error(ClientError::api_error(500, "boom"), &key);
        assert!(matches!(err, StoreError::Coordinator(_)));
        assert!(!err.is_permanent());
    }
}
