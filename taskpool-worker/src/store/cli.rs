//! Task store that drives the coordinator executable
//!
//! Each operation runs one coordinator subcommand and reads the JSON document
//! it prints. Lease loss and missing tasks come back as dedicated exit codes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::{Task, TaskKey, TaskStatus};
use taskpool_core::dto::cli::{EXIT_LEASE_LOST, EXIT_NOT_FOUND};
use taskpool_core::dto::task::ClaimResponse;
use taskpool_core::protocol::tail_chars;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Result, StoreError, TaskStore};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CliStore {
    program: PathBuf,
    base_args: Vec<String>,
    node_id: String,
    call_timeout: Duration,
}

impl CliStore {
    pub fn new(program: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            node_id: node_id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Arguments passed before every subcommand
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Run one subcommand, returning its stdout
    ///
    /// `key` names the task the call is about, so exit codes can be mapped.
    async fn invoke(
        &self,
        args: &[String],
        input: Option<String>,
        key: Option<&TaskKey>,
    ) -> Result<String> {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        debug!("Running {} {}", self.program.display(), subcommand);

        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StoreError::Command(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                StoreError::Command(format!("failed to write to {}: {}", subcommand, e))
            })?;
            // Dropping stdin closes the pipe
        }

        let output = tokio::time::timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                StoreError::Command(format!(
                    "{} timed out after {:?}",
                    subcommand, self.call_timeout
                ))
            })?
            .map_err(|e| StoreError::Command(format!("{} failed: {}", subcommand, e)))?;

        let code = output.status.code();
        match (code, key) {
            (Some(0), _) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            (Some(c), Some(key)) if c == i32::from(EXIT_LEASE_LOST) => {
                Err(StoreError::LeaseLost(key.clone()))
            }
            (Some(c), Some(key)) if c == i32::from(EXIT_NOT_FOUND) => {
                Err(StoreError::NotFound(key.clone()))
            }
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(StoreError::Command(format!(
                    "{} exited with {}: {}",
                    subcommand,
                    output.status,
                    tail_chars(stderr.trim(), 500)
                )))
            }
        }
    }

    async fn invoke_json<T: DeserializeOwned>(
        &self,
        args: &[String],
        input: Option<String>,
        key: Option<&TaskKey>,
    ) -> Result<T> {
        let stdout = self.invoke(args, input, key).await?;
        decode_last_line(&stdout)
    }
}

/// Append the task id after `--` so ids starting with `-` stay positional
fn with_task_id(mut args: Vec<String>, key: &TaskKey) -> Vec<String> {
    args.push("--".to_string());
    args.push(key.id.clone());
    args
}

/// Decode the last non-empty line of the coordinator's output
fn decode_last_line<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| StoreError::Decode("coordinator printed nothing".to_string()))?;

    serde_json::from_str(line)
        .map_err(|e| StoreError::Decode(format!("unexpected coordinator output: {}", e)))
}

#[async_trait]
impl TaskStore for CliStore {
    async fn poll(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let mut args = vec!["poll".to_string()];
        if let Some(project) = project {
            args.push(format!("--project={}", project));
        }
        self.invoke_json(&args, None, None).await
    }

    async fn claim(&self, key: &TaskKey) -> Result<bool> {
        let args = with_task_id(
            vec!["claim".to_string(), format!("--node={}", self.node_id)],
            key,
        );
        let response: ClaimResponse = self.invoke_json(&args, None, Some(key)).await?;
        Ok(response.claimed)
    }

    async fn heartbeat(&self, key: &TaskKey) -> Result<()> {
        let args = with_task_id(
            vec!["heartbeat".to_string(), format!("--node={}", self.node_id)],
            key,
        );
        self.invoke(&args, None, Some(key)).await?;
        Ok(())
    }

    async fn finish(
        &self,
        key: &TaskKey,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&TaskResult>,
    ) -> Result<()> {
        let mut args = vec![
            "finish".to_string(),
            format!("--node={}", self.node_id),
            format!("--status={}", status),
        ];
        if let Some(error) = error {
            args.push(format!("--error={}", error));
        }

        let input = match result {
            Some(result) => {
                args.push("--result-stdin".to_string());
                Some(
                    result
                        .to_line()
                        .map_err(|e| StoreError::Decode(format!("unencodable result: {}", e)))?,
                )
            }
            None => None,
        };

        let args = with_task_id(args, key);
        self.invoke(&args, input, Some(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// A stand-in coordinator: a shell script run through `sh`
    fn fake_coordinator(dir: &Path, body: &str) -> CliStore {
        let script = dir.join("coordinator.sh");
        std::fs::write(&script, body).unwrap();
        CliStore::new("sh", "node-1")
            .with_args(vec![script.display().to_string()])
    }

    #[tokio::test]
    async fn test_poll_decodes_tasks() {
        let dir = TempDir::new().unwrap();
        let store = fake_coordinator(
            dir.path(),
            r#"echo '[{"id":"T1","project":"web","status":"PENDING","command":"true"}]'"#,
        );

        let tasks = store.poll(Some("web")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "T1");
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_passes_node_id() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let store = fake_coordinator(
            dir.path(),
            &format!(
                "echo \"$@\" > {}\necho '{{\"claimed\":false}}'",
                args_file.display()
            ),
        );

        let claimed = store.claim(&TaskKey::new("web", "T1")).await.unwrap();
        assert!(!claimed);

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "claim --node=node-1 -- T1");
    }

    #[tokio::test]
    async fn test_dash_leading_id_stays_positional() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let store = fake_coordinator(
            dir.path(),
            &format!("echo \"$@\" > {}", args_file.display()),
        );

        store
            .finish(
                &TaskKey::new("web", "-x"),
                TaskStatus::Failed,
                Some("boom"),
                None,
            )
            .await
            .unwrap();

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            "finish --node=node-1 --status=FAILED --error=boom -- -x"
        );
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_errors() {
        let dir = TempDir::new().unwrap();
        let key = TaskKey::new("web", "T1");

        let store = fake_coordinator(dir.path(), "exit 3");
        let err = store.heartbeat(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost(_)));

        let store = fake_coordinator(dir.path(), "exit 4");
        let err = store.heartbeat(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let store = fake_coordinator(dir.path(), "echo 'db down' >&2; exit 1");
        let err = store.heartbeat(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Command(ref msg) if msg.contains("db down")));
    }

    #[tokio::test]
    async fn test_finish_sends_result_on_stdin() {
        let dir = TempDir::new().unwrap();
        let stdin_file = dir.path().join("stdin.json");
        let store = fake_coordinator(
            dir.path(),
            &format!("cat > {}\necho '{{\"ok\":true}}'", stdin_file.display()),
        );

        let result = TaskResult::completed("T1").with_metric("exit_code", 0);
        store
            .finish(
                &TaskKey::new("web", "T1"),
                TaskStatus::Completed,
                None,
                Some(&result),
            )
            .await
            .unwrap();

        let sent: TaskResult =
            serde_json::from_str(&std::fs::read_to_string(&stdin_file).unwrap()).unwrap();
        assert_eq!(sent.task_id, "T1");
        assert!(sent.ok);
    }

    #[test]
    fn test_decode_last_line() {
        let response: ClaimResponse =
            decode_last_line("noise\n{\"claimed\":true}\n\n").unwrap();
        assert!(response.claimed);

        assert!(decode_last_line::<ClaimResponse>("").is_err());
        assert!(decode_last_line::<ClaimResponse>("not json").is_err());
    }
}
