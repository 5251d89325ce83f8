//! Taskpool HTTP Client
//!
//! A typed HTTP client for the taskpool coordinator API.
//!
//! Worker nodes use it as their HTTP-backed task store, and tooling can use it
//! to submit tasks and inspect their status.
//!
//! # Example
//!
//! ```no_run
//! use taskpool_client::CoordinatorClient;
//! use taskpool_core::dto::task::CreateTask;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CoordinatorClient::new("http://localhost:8080");
//!
//!     let task = client.create_task(CreateTask {
//!         id: "build-42".to_string(),
//!         project: "web".to_string(),
//!         spec_reference: String::new(),
//!         dependencies: vec![],
//!         command: Some("make test".to_string()),
//!         working_dir: None,
//!         env: Default::default(),
//!         timeout_secs: Some(600),
//!     }).await?;
//!
//!     println!("Created task: {}", task.id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod tasks;

pub use error::{ClientError, Result};

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;

/// HTTP client for the coordinator API
///
/// Groups:
/// - Task submission and queries (create, get, list)
/// - Worker protocol (eligible, claim, heartbeat, finish)
/// - Maintenance (reap expired leases, health)
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    /// Base URL of the coordinator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl CoordinatorClient {
    /// Create a new coordinator client
    ///
    /// # Example
    /// ```
    /// use taskpool_client::CoordinatorClient;
    ///
    /// let client = CoordinatorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client with a preconfigured reqwest `Client` (timeouts, TLS, proxies)
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check the coordinator is up
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// `/api/tasks/{task_id}[/{action}]`, with the id percent-encoded
    fn task_url(&self, task_id: &str, action: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ClientError::InvalidUrl(format!("{} cannot be a base URL", self.base_url))
            })?;
            segments.pop_if_empty().extend(["api", "tasks", task_id]);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Checks the status code and deserializes a JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Checks the status code of a response without a body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
