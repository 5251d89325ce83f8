//! Output protocol normalizer
//!
//! Converts whatever a task process printed into one canonical [`TaskResult`].
//! Tasks that speak the protocol emit a single JSON line containing at least an
//! `ok` field; everything else falls back to exit-code inference.
//!
//! Resolution order:
//! 1. The last stdout line that is a JSON object with an `ok` field
//! 2. The whole stdout parsed as one such object (pretty-printed output)
//! 3. The exit code: `0` is COMPLETED, anything else FAILED
//! 4. No exit code either: PARSE_ERROR with the raw output attached

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::domain::result::{ResultStatus, TaskResult};

/// Version stamped on every record this crate produces
pub const PROTOCOL_VERSION: &str = "1.0";

/// Characters of output kept as evidence when the result is inferred
pub const EVIDENCE_TAIL_CHARS: usize = 2000;

/// Characters of raw output kept on a parse error
pub const RAW_OUTPUT_LIMIT: usize = 1000;

/// Upper bound for stdout/stderr attached to any result
pub const MAX_CAPTURE_CHARS: usize = 10_000;

/// Normalizes raw process output into a `TaskResult`
///
/// # Arguments
/// * `stdout` - Everything the process wrote to stdout
/// * `stderr` - Everything the process wrote to stderr
/// * `task_id` - Used when the record does not name a task
/// * `exit_code` - `None` when the process outcome is unknown. Callers report
///   death by signal `n` as `128 + n`.
pub fn parse(stdout: &str, stderr: &str, task_id: &str, exit_code: Option<i32>) -> TaskResult {
    if let Some(record) = last_result_line(stdout).or_else(|| parse_record(stdout.trim())) {
        return from_record(record, task_id, stdout, stderr);
    }

    match exit_code {
        Some(0) => TaskResult::completed(task_id)
            .with_output(
                non_empty(tail_chars(stdout, EVIDENCE_TAIL_CHARS)),
                non_empty(tail_chars(stderr, EVIDENCE_TAIL_CHARS)),
            )
            .with_metric("exit_code", 0)
            .with_metric("inferred_from_exit_code", true),
        Some(code) => {
            let stderr_tail = tail_chars(stderr.trim_end(), EVIDENCE_TAIL_CHARS);
            let error = if stderr_tail.trim().is_empty() {
                format!("exit code {}", code)
            } else {
                stderr_tail.to_string()
            };

            TaskResult::failed(task_id, error)
                .with_output(
                    non_empty(tail_chars(stdout, EVIDENCE_TAIL_CHARS)),
                    non_empty(stderr_tail),
                )
                .with_metric("exit_code", code)
                .with_metric("inferred_from_exit_code", true)
        }
        None => {
            let raw = format!("{}{}", stdout, stderr);
            TaskResult::new(task_id, ResultStatus::ParseError)
                .with_error("no structured result and no exit code")
                .with_output(non_empty(head_chars(&raw, RAW_OUTPUT_LIMIT)), None)
        }
    }
}

/// Scans stdout from the end for the last line carrying a result record
fn last_result_line(stdout: &str) -> Option<Map<String, Value>> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(parse_record)
}

/// Parses `text` as a JSON object that has an `ok` field
fn parse_record(text: &str) -> Option<Map<String, Value>> {
    if text.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(map) if map.contains_key("ok") => Some(map),
        _ => None,
    }
}

/// Builds a result from a structured record, tolerating missing or odd fields
fn from_record(
    mut record: Map<String, Value>,
    task_id: &str,
    stdout: &str,
    stderr: &str,
) -> TaskResult {
    let ok = record.get("ok").and_then(Value::as_bool).unwrap_or(false);

    let status = record
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<ResultStatus>().ok())
        .unwrap_or(if ok {
            ResultStatus::Completed
        } else {
            ResultStatus::Failed
        });

    let artifacts = match record.remove("artifacts") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let metrics = match record.remove("metrics") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let error = match record.remove("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    let timestamp = record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    TaskResult {
        ok,
        task_id: string_field(&record, "task_id").unwrap_or_else(|| task_id.to_string()),
        status,
        artifacts,
        stdout: string_field(&record, "stdout")
            .or_else(|| non_empty(tail_chars(stdout, MAX_CAPTURE_CHARS))),
        stderr: string_field(&record, "stderr")
            .or_else(|| non_empty(tail_chars(stderr, MAX_CAPTURE_CHARS))),
        metrics,
        error,
        timestamp,
        protocol_version: string_field(&record, "protocol_version")
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
    }
}

fn string_field(record: &Map<String, Value>, key: &str) -> Option<String> {
    record.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Returns at most the last `max` characters of `s`
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }

    s.char_indices()
        .nth(count - max)
        .map(|(idx, _)| &s[idx..])
        .unwrap_or("")
}

/// Returns at most the first `max` characters of `s`
pub fn head_chars(s: &str, max: usize) -> &str {
    s.char_indices()
        .nth(max)
        .map(|(idx, _)| &s[..idx])
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_last_structured_line() {
        let stdout = concat!(
            "starting build\n",
            "{\"ok\": false, \"task_id\": \"T1\", \"status\": \"FAILED\"}\n",
            "retrying\n",
            "{\"ok\": true, \"task_id\": \"T1\", \"status\": \"COMPLETED\", \"artifacts\": [{\"path\": \"out.txt\"}]}\n",
            "done\n",
        );

        let result = parse(stdout, "", "T1", Some(0));
        assert!(result.ok);
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0]["path"], "out.txt");
        assert!(!result.metrics.contains_key("inferred_from_exit_code"));
    }

    #[test]
    fn test_ignores_json_lines_without_ok() {
        let stdout = "{\"ok\": true, \"status\": \"COMPLETED\"}\n{\"progress\": 90}\n";

        let result = parse(stdout, "", "T1", Some(1));
        assert!(result.ok);
        assert_eq!(result.task_id, "T1");
        assert_eq!(result.status, ResultStatus::Completed);
    }

    #[test]
    fn test_structured_record_wins_over_exit_code() {
        let stdout = "{\"ok\": false, \"task_id\": \"T9\", \"status\": \"FAILED\", \"error\": \"lint\"}";

        let result = parse(stdout, "", "T9", Some(0));
        assert!(!result.ok);
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("lint"));
    }

    #[test]
    fn test_whole_stdout_as_pretty_printed_object() {
        let stdout = "{\n  \"ok\": true,\n  \"task_id\": \"T2\",\n  \"metrics\": {\"files\": 3}\n}\n";

        let result = parse(stdout, "", "T2", None);
        assert!(result.ok);
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.metrics["files"], 3);
    }

    #[test]
    fn test_lenient_record_fields() {
        let stdout = r#"{"ok": false, "status": "weird", "error": {"code": 7}, "artifacts": [1, {"a": 1}], "timestamp": "yesterday"}"#;

        let result = parse(stdout, "warn", "T3", Some(0));
        assert_eq!(result.task_id, "T3");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("{\"code\":7}"));
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.stderr.as_deref(), Some("warn"));
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_exit_zero_infers_completed() {
        let result = parse("built 3 files\n", "", "T4", Some(0));
        assert!(result.ok);
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.stdout.as_deref(), Some("built 3 files\n"));
        assert_eq!(result.metrics["inferred_from_exit_code"], true);
        assert_eq!(result.exit_code(), Some(0));
    }

    #[test]
    fn test_nonzero_exit_infers_failed_with_stderr_tail() {
        let stderr = format!("{}fatal: boom", "x".repeat(5000));

        let result = parse("", &stderr, "T5", Some(2));
        assert!(!result.ok);
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.exit_code(), Some(2));
        let error = result.error.unwrap();
        assert!(error.ends_with("fatal: boom"));
        assert_eq!(error.chars().count(), EVIDENCE_TAIL_CHARS);
    }

    #[test]
    fn test_nonzero_exit_without_stderr_synthesizes_message() {
        let result = parse("", "", "T6", Some(1));
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("exit code 1"));
        assert_eq!(result.metrics["exit_code"], 1);
    }

    #[test]
    fn test_no_exit_code_is_parse_error() {
        let stdout = "y".repeat(3000);

        let result = parse(&stdout, "tail", "T7", None);
        assert!(!result.ok);
        assert_eq!(result.status, ResultStatus::ParseError);
        assert_eq!(
            result.stdout.unwrap().chars().count(),
            RAW_OUTPUT_LIMIT
        );
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(tail_chars(s, 5), "wörld");
        assert_eq!(head_chars(s, 2), "hé");
        assert_eq!(tail_chars(s, 100), s);
        assert_eq!(head_chars(s, 100), s);
        assert_eq!(tail_chars(s, 0), "");
    }
}
