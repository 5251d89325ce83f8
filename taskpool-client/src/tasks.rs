//! Task-related API endpoints

use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskStatus};
use taskpool_core::dto::task::{
    ClaimResponse, ClaimTask, CreateTask, FinishTask, HeartbeatTask, ReapResponse, TaskQuery,
};

use crate::CoordinatorClient;
use crate::error::Result;

impl CoordinatorClient {
    // =============================================================================
    // Submission & Queries
    // =============================================================================

    /// Create a new pending task
    pub async fn create_task(&self, req: CreateTask) -> Result<Task> {
        let url = format!("{}/api/tasks", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let url = self.task_url(task_id, None)?;
        let response = self.client.get(url).send().await?;

        self.handle_response(response).await
    }

    /// List tasks, optionally filtered by project and status
    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let url = format!("{}/api/tasks", self.base_url);
        let response = self.client.get(&url).query(query).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Worker Protocol
    // =============================================================================

    /// Pending tasks whose dependencies are all completed
    ///
    /// # Arguments
    /// * `project` - Restrict to one project; `None` polls every project
    pub async fn eligible_tasks(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let url = format!("{}/api/tasks/eligible", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(project) = project {
            request = request.query(&[("project", project)]);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// Attempt to claim a task for `node_id`
    ///
    /// Returns `false` when another node claimed it first.
    pub async fn claim_task(&self, task_id: &str, node_id: &str) -> Result<bool> {
        let url = self.task_url(task_id, Some("claim"))?;
        let response = self
            .client
            .post(url)
            .json(&ClaimTask {
                node_id: node_id.to_string(),
            })
            .send()
            .await?;

        let claim: ClaimResponse = self.handle_response(response).await?;
        Ok(claim.claimed)
    }

    /// Renew the lease; fails with status 409 once the lease is gone
    pub async fn heartbeat(&self, task_id: &str, node_id: &str) -> Result<()> {
        let url = self.task_url(task_id, Some("heartbeat"))?;
        let response = self
            .client
            .post(url)
            .json(&HeartbeatTask {
                node_id: node_id.to_string(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Report the final status of a task held by `node_id`
    pub async fn finish_task(
        &self,
        task_id: &str,
        node_id: &str,
        status: TaskStatus,
        error: Option<String>,
        result: Option<TaskResult>,
    ) -> Result<()> {
        let url = self.task_url(task_id, Some("finish"))?;

        tracing::debug!("Finishing task {} as {}", task_id, status);

        let response = self
            .client
            .post(url)
            .json(&FinishTask {
                node_id: node_id.to_string(),
                status,
                error,
                result,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Return tasks with expired leases to `Pending`
    pub async fn reap_expired(&self) -> Result<u64> {
        let url = format!("{}/api/tasks/reap", self.base_url);
        let response = self.client.post(&url).send().await?;

        let reap: ReapResponse = self.handle_response(response).await?;
        Ok(reap.reaped)
    }
}
