//! Worker configuration
//!
//! Node identity, which task store to use, the slot budget and every interval
//! and timeout the node works with. Loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which task store implementation the node talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Coordinator HTTP API
    Http,
    /// Coordinator executable invoked once per operation
    Cli,
    /// Per-task status files under a shared directory tree
    Fs,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(StoreBackend::Http),
            "cli" => Ok(StoreBackend::Cli),
            "fs" | "file" | "files" => Ok(StoreBackend::Fs),
            other => anyhow::bail!("unknown store backend '{}' (expected http, cli or fs)", other),
        }
    }
}

/// Worker node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node; recorded as the lease owner
    pub node_id: String,

    pub backend: StoreBackend,

    /// Coordinator base URL (http backend)
    pub coordinator_url: String,

    /// Coordinator executable (cli backend)
    pub coordinator_bin: PathBuf,

    /// Global flags placed before every coordinator subcommand (cli backend)
    pub coordinator_args: Vec<String>,

    /// Root of the `<project>/tasks/<task_id>/` tree (fs backend)
    pub tasks_root: PathBuf,

    /// Projects to poll; empty means all
    pub projects: Vec<String>,

    /// Maximum concurrently running tasks
    pub max_slots: usize,

    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,

    /// Timeout for tasks that do not carry their own
    pub task_timeout: Duration,

    /// Wait between SIGTERM and SIGKILL when tearing down a process group
    pub kill_grace: Duration,

    /// Silence after which another node's lease counts as expired (fs backend)
    pub lease_timeout: Duration,

    /// Bound on the watcher's set of already-handled tasks
    pub seen_capacity: usize,

    /// Command for tasks without one; `{task_id}`, `{project}` and `{spec}` are substituted
    pub command_template: Option<String>,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            backend: StoreBackend::Http,
            coordinator_url: "http://localhost:8080".to_string(),
            coordinator_bin: PathBuf::from("taskpool-coordinator"),
            coordinator_args: Vec::new(),
            tasks_root: PathBuf::from("./projects"),
            projects: Vec::new(),
            max_slots: 2,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(90),
            seen_capacity: 10_000,
            command_template: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// All variables are optional:
    /// - NODE_ID (default: random UUID)
    /// - STORE_BACKEND (http | cli | fs, default: http)
    /// - COORDINATOR_URL, COORDINATOR_BIN, TASKS_ROOT
    /// - COORDINATOR_ARGS (whitespace separated)
    /// - PROJECTS (comma separated)
    /// - MAX_SLOTS (default: 2)
    /// - POLL_INTERVAL, HEARTBEAT_INTERVAL, TASK_TIMEOUT, LEASE_TIMEOUT (seconds)
    /// - KILL_GRACE or CLEANUP_KILL_TIMEOUT (seconds, default: 1)
    /// - SEEN_CAPACITY (default: 10000)
    /// - TASK_COMMAND_TEMPLATE
    pub fn from_env() -> anyhow::Result<Self> {
        let node_id = std::env::var("NODE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut config = Self::new(node_id);

        if let Ok(backend) = std::env::var("STORE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var("COORDINATOR_URL") {
            config.coordinator_url = url;
        }
        if let Ok(bin) = std::env::var("COORDINATOR_BIN") {
            config.coordinator_bin = PathBuf::from(bin);
        }
        if let Ok(args) = std::env::var("COORDINATOR_ARGS") {
            config.coordinator_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(root) = std::env::var("TASKS_ROOT") {
            config.tasks_root = PathBuf::from(root);
        }
        if let Ok(projects) = std::env::var("PROJECTS") {
            config.projects = parse_list(&projects);
        }

        config.max_slots = env_parse("MAX_SLOTS")?.unwrap_or(config.max_slots);
        config.poll_interval = env_secs("POLL_INTERVAL")?.unwrap_or(config.poll_interval);
        config.heartbeat_interval =
            env_secs("HEARTBEAT_INTERVAL")?.unwrap_or(config.heartbeat_interval);
        config.task_timeout = env_secs("TASK_TIMEOUT")?.unwrap_or(config.task_timeout);
        config.lease_timeout = env_secs("LEASE_TIMEOUT")?.unwrap_or(config.lease_timeout);
        config.kill_grace = match env_secs("KILL_GRACE")? {
            Some(grace) => grace,
            None => env_secs("CLEANUP_KILL_TIMEOUT")?.unwrap_or(config.kill_grace),
        };
        config.seen_capacity = env_parse("SEEN_CAPACITY")?.unwrap_or(config.seen_capacity);
        config.command_template = std::env::var("TASK_COMMAND_TEMPLATE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }

        if self.backend == StoreBackend::Http
            && !self.coordinator_url.starts_with("http://")
            && !self.coordinator_url.starts_with("https://")
        {
            anyhow::bail!("coordinator_url must start with http:// or https://");
        }

        if self.max_slots == 0 {
            anyhow::bail!("max_slots must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.task_timeout.is_zero() {
            anyhow::bail!("task_timeout must be greater than 0");
        }

        if self.lease_timeout <= self.heartbeat_interval {
            anyhow::bail!("lease_timeout must be longer than heartbeat_interval");
        }

        if self.seen_capacity == 0 {
            anyhow::bail!("seen_capacity must be greater than 0");
        }

        Ok(())
    }
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> anyhow::Result<Option<Duration>> {
    env_parse::<f64>(name)?
        .map(|secs| parse_secs(name, secs))
        .transpose()
}

/// Negative, non-finite and out-of-range values are rejected
fn parse_secs(name: &str, secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", name, secs, e))
}
