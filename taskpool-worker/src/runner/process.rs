//! Process group signalling
//!
//! Every task command is the leader of its own process group, so anything it
//! forks can be reached with a single `kill(-pgid, sig)`.

use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Send `signal` to every process in group `pgid`
///
/// Returns `false` when nothing was signalled. A group that has already
/// exited is not an error.
pub fn signal_group(pgid: i32, signal: i32) -> bool {
    // kill(-1) and kill(0) would hit far more than one task
    if pgid <= 1 {
        warn!("Refusing to signal process group {}", pgid);
        return false;
    }

    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        return true;
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process group {} already gone", pgid);
    } else {
        warn!("Failed to signal process group {}: {}", pgid, err);
    }
    false
}

/// Whether any process in group `pgid` still exists
pub fn group_alive(pgid: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(-pgid, 0) == 0 }
}

/// Wait up to `grace` for group `pgid` to empty; `true` once it has
pub async fn wait_for_group_exit(pgid: i32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while group_alive(pgid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_dangerous_groups() {
        assert!(!signal_group(0, libc::SIGTERM));
        assert!(!signal_group(1, libc::SIGTERM));
        assert!(!signal_group(-5, libc::SIGTERM));
        assert!(!group_alive(0));
    }

    #[test]
    fn test_missing_group_is_quiet() {
        // Far above any pid_max the kernel hands out
        assert!(!signal_group(i32::MAX - 1, libc::SIGTERM));
        assert!(!group_alive(i32::MAX - 1));
    }

    #[tokio::test]
    async fn test_wait_for_missing_group() {
        assert!(wait_for_group_exit(i32::MAX - 1, Duration::from_millis(10)).await);
    }
}
