//! Task runner
//!
//! Runs one task command at a time per call as the leader of a fresh process
//! group, enforces its timeout, and turns whatever it printed into a
//! canonical [`TaskResult`]. Running tasks are tracked so they can be
//! listed and killed from outside.

pub mod process;
pub mod registry;

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use taskpool_core::domain::result::TaskResult;
use taskpool_core::domain::task::TaskKey;
use taskpool_core::protocol::{self, EVIDENCE_TAIL_CHARS, MAX_CAPTURE_CHARS, tail_chars};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use registry::RunningTaskInfo;
use registry::Registry;

/// Bytes of each stream held in memory; older output is dropped first
const MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

/// How long to wait for pipes to drain once the process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error recorded on tasks stopped through [`TaskRunner::kill`]
pub const CANCELLED: &str = "cancelled";

pub struct TaskRunner {
    registry: Registry,
    kill_grace: Duration,
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

impl TaskRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            registry: Registry::new(),
            kill_grace,
        }
    }

    /// Run `command` through `sh -c` and report the outcome
    ///
    /// Never fails: spawn errors, timeouts and cancellation all come back as
    /// results.
    pub async fn execute(
        &self,
        key: &TaskKey,
        command: &str,
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
        timeout: Duration,
        lease_owner: &str,
    ) -> TaskResult {
        let task_id = key.id.as_str();
        let started = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn task {}: {}", key, e);
                return TaskResult::failed(task_id, format!("Failed to spawn task: {}", e))
                    .with_metric("elapsed_seconds", elapsed_secs(started));
            }
        };

        let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return TaskResult::failed(task_id, "Task exited before its pid was known")
                .with_metric("elapsed_seconds", elapsed_secs(started));
        };

        let guard = self.registry.register(key, pgid, lease_owner, timeout);
        info!(
            "Task {} started (pgid {}, timeout {:?})",
            key, pgid, timeout
        );

        let stdout = OutputCapture::start(child.stdout.take());
        let stderr = OutputCapture::start(child.stderr.take());

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        let exit_status = match &outcome {
            Outcome::Exited(status) => {
                if guard.was_cancelled() {
                    // The leader went down on SIGTERM; the rest still get the grace period
                    process::wait_for_group_exit(pgid, self.kill_grace).await;
                }
                // Background jobs the command left behind go with it
                if process::group_alive(pgid) {
                    debug!("Reaping leftover processes of task {}", key);
                    process::signal_group(pgid, libc::SIGKILL);
                }
                Some(*status)
            }
            Outcome::TimedOut => {
                warn!(
                    "Task {} exceeded its timeout of {:?}, terminating process group {}",
                    key, timeout, pgid
                );
                self.terminate_group(pgid, &mut child).await
            }
            Outcome::WaitFailed(e) => {
                error!("Failed waiting for task {}: {}", key, e);
                self.terminate_group(pgid, &mut child).await
            }
        };

        let stdout = stdout.collect(OUTPUT_DRAIN_TIMEOUT).await;
        let stderr = stderr.collect(OUTPUT_DRAIN_TIMEOUT).await;
        let elapsed = elapsed_secs(started);

        let mut result = if guard.was_cancelled() {
            TaskResult::failed(task_id, CANCELLED).with_output(
                non_empty(tail_chars(&stdout, EVIDENCE_TAIL_CHARS)),
                non_empty(tail_chars(&stderr, EVIDENCE_TAIL_CHARS)),
            )
        } else {
            match outcome {
                Outcome::Exited(status) => {
                    protocol::parse(&stdout, &stderr, task_id, shell_exit_code(status))
                }
                Outcome::TimedOut => TaskResult::timeout(
                    task_id,
                    format!("Task exceeded timeout of {}s", timeout.as_secs_f64()),
                )
                .with_output(
                    non_empty(tail_chars(&stdout, EVIDENCE_TAIL_CHARS)),
                    non_empty(tail_chars(&stderr, EVIDENCE_TAIL_CHARS)),
                )
                .with_metric("timeout_seconds", timeout.as_secs_f64()),
                Outcome::WaitFailed(e) => {
                    TaskResult::failed(task_id, format!("Failed waiting for task: {}", e))
                }
            }
        };

        result
            .metrics
            .insert("elapsed_seconds".to_string(), elapsed.into());
        if let Some(status) = exit_status {
            if let Some(code) = shell_exit_code(status) {
                result
                    .metrics
                    .entry("exit_code")
                    .or_insert_with(|| code.into());
            }
            if let Some(signal) = status.signal() {
                result.metrics.insert("signal".to_string(), signal.into());
            }
        }
        cap_output(&mut result);

        info!(
            "Task {} finished: {} in {:.3}s",
            key, result.status, elapsed
        );

        drop(guard);
        result
    }

    /// SIGTERM the group, give it the grace period, then SIGKILL
    ///
    /// Returns the leader's exit status once it has been reaped.
    async fn terminate_group(&self, pgid: i32, child: &mut Child) -> Option<ExitStatus> {
        process::signal_group(pgid, libc::SIGTERM);

        let status = tokio::time::timeout(self.kill_grace, child.wait())
            .await
            .ok()
            .and_then(Result::ok);

        if process::group_alive(pgid) {
            debug!("Process group {} survived SIGTERM, sending SIGKILL", pgid);
            process::signal_group(pgid, libc::SIGKILL);
        }

        match status {
            Some(status) => Some(status),
            None => child.wait().await.ok(),
        }
    }

    /// Stop a running task out of band
    ///
    /// Returns `false` if that task is not running here. The task's own
    /// `execute` call reports it FAILED with error "cancelled".
    pub async fn kill(&self, key: &TaskKey) -> bool {
        let Some(handle) = self.registry.kill_handle(key) else {
            debug!("Kill requested for task {} which is not running", key);
            return false;
        };

        info!("Killing task {} (pgid {})", key, handle.pgid);
        handle
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        process::signal_group(handle.pgid, libc::SIGTERM);

        tokio::time::sleep(self.kill_grace).await;

        // The group id may have been recycled once the task was reaped
        if self.registry.is_current(key, &handle) && process::group_alive(handle.pgid) {
            process::signal_group(handle.pgid, libc::SIGKILL);
        }

        true
    }

    /// Kill every running task; used on shutdown
    pub async fn kill_all(&self) -> usize {
        let handles: Vec<_> = self
            .registry
            .keys()
            .into_iter()
            .filter_map(|key| self.registry.kill_handle(&key).map(|h| (key, h)))
            .collect();

        if handles.is_empty() {
            return 0;
        }

        for (key, handle) in &handles {
            info!("Cancelling task {} (pgid {})", key, handle.pgid);
            handle
                .cancelled
                .store(true, std::sync::atomic::Ordering::SeqCst);
            process::signal_group(handle.pgid, libc::SIGTERM);
        }

        tokio::time::sleep(self.kill_grace).await;

        for (key, handle) in &handles {
            if self.registry.is_current(key, handle) && process::group_alive(handle.pgid) {
                process::signal_group(handle.pgid, libc::SIGKILL);
            }
        }

        handles.len()
    }

    pub fn list_running(&self) -> Vec<RunningTaskInfo> {
        self.registry.snapshot()
    }

    pub fn running_count(&self) -> usize {
        self.registry.count()
    }
}

/// Accumulates one output stream in the background
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl OutputCapture {
    fn start<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);

        let reader = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 8192];

            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > MAX_BUFFERED_BYTES {
                            let excess = buf.len() - MAX_BUFFERED_BYTES;
                            buf.drain(..excess);
                        }
                    }
                    Err(e) => {
                        debug!("Output stream closed with error: {}", e);
                        break;
                    }
                }
            }
        });

        Self { buffer, reader }
    }

    /// Everything read so far, waiting up to `wait` for the stream to close
    ///
    /// A descendant that escaped the process group can hold the pipe open;
    /// whatever arrived before the deadline is still returned.
    async fn collect(self, wait: Duration) -> String {
        let mut reader = self.reader;
        if tokio::time::timeout(wait, &mut reader).await.is_err() {
            debug!("Output stream still open after {:?}, abandoning it", wait);
            reader.abort();
        }

        let buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Exit code as a shell reports it: death by signal `n` reads as `128 + n`
fn shell_exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

fn elapsed_secs(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Keep attached output within bounds whatever the task claimed
fn cap_output(result: &mut TaskResult) {
    for stream in [&mut result.stdout, &mut result.stderr] {
        if let Some(text) = stream {
            if text.chars().count() > MAX_CAPTURE_CHARS {
                *text = tail_chars(text, MAX_CAPTURE_CHARS).to_string();
            }
        }
    }
}
