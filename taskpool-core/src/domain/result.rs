//! Canonical task result record
//!
//! Every task attempt produces exactly one `TaskResult`, whatever the process
//! actually printed. Task authors may emit it themselves as a single JSON line;
//! otherwise the normalizer in [`crate::protocol`] synthesizes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::domain::task::{TaskStatus, UnknownStatus};
use crate::protocol::PROTOCOL_VERSION;

/// Outcome classification carried by a `TaskResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Completed,
    Failed,
    Timeout,
    ParseError,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "COMPLETED",
            ResultStatus::Failed => "FAILED",
            ResultStatus::Timeout => "TIMEOUT",
            ResultStatus::ParseError => "PARSE_ERROR",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" => Ok(ResultStatus::Completed),
            "FAILED" => Ok(ResultStatus::Failed),
            "TIMEOUT" => Ok(ResultStatus::Timeout),
            "PARSE_ERROR" => Ok(ResultStatus::ParseError),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// The canonical, protocol-versioned outcome of one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub ok: bool,
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub artifacts: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub protocol_version: String,
}

impl TaskResult {
    /// Creates an empty result; `ok` follows `status == Completed`
    pub fn new(task_id: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            ok: status == ResultStatus::Completed,
            task_id: task_id.into(),
            status,
            artifacts: Vec::new(),
            stdout: None,
            stderr: None,
            metrics: Map::new(),
            error: None,
            timestamp: Utc::now(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn completed(task_id: impl Into<String>) -> Self {
        Self::new(task_id, ResultStatus::Completed)
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(task_id, ResultStatus::Failed).with_error(error)
    }

    pub fn timeout(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(task_id, ResultStatus::Timeout).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn with_output(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Exit code recorded in the metrics, if any
    pub fn exit_code(&self) -> Option<i64> {
        self.metrics.get("exit_code").and_then(Value::as_i64)
    }

    /// Status to report back to the task store
    ///
    /// Only an `ok` COMPLETED record counts as success; parse errors and
    /// contradictory records are reported as failures.
    pub fn final_status(&self) -> TaskStatus {
        match self.status {
            ResultStatus::Completed if self.ok => TaskStatus::Completed,
            ResultStatus::Timeout => TaskStatus::Timeout,
            _ => TaskStatus::Failed,
        }
    }

    /// Serializes the record as a single JSON line (the wire format)
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_status_mapping() {
        assert_eq!(
            TaskResult::completed("T1").final_status(),
            TaskStatus::Completed
        );
        assert_eq!(
            TaskResult::failed("T1", "boom").final_status(),
            TaskStatus::Failed
        );
        assert_eq!(
            TaskResult::timeout("T1", "too slow").final_status(),
            TaskStatus::Timeout
        );
        assert_eq!(
            TaskResult::new("T1", ResultStatus::ParseError).final_status(),
            TaskStatus::Failed
        );

        let mut contradictory = TaskResult::completed("T1");
        contradictory.ok = false;
        assert_eq!(contradictory.final_status(), TaskStatus::Failed);
    }

    #[test]
    fn test_to_line_is_single_line_and_skips_empty_fields() {
        let result = TaskResult::completed("T1")
            .with_metric("exit_code", 0)
            .with_output(Some("line one\nline two".to_string()), None);

        let line = result.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains("\"stderr\""));
        assert!(line.contains("\"status\":\"COMPLETED\""));
        assert!(line.contains("\"protocol_version\":\"1.0\""));
    }

    #[test]
    fn test_exit_code_reads_metrics() {
        let result = TaskResult::failed("T1", "exit code 3").with_metric("exit_code", 3);
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(TaskResult::completed("T1").exit_code(), None);
    }

    #[test]
    fn test_result_status_parsing() {
        assert_eq!(
            "parse_error".parse::<ResultStatus>(),
            Ok(ResultStatus::ParseError)
        );
        assert!("SUCCESS".parse::<ResultStatus>().is_err());
    }
}
