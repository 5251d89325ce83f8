//! Scheduler layer for the worker
//!
//! Polls a task store for eligible work and manages each claimed task from
//! claim to finish. The watcher adapts the filesystem store to the same loop.

pub mod poller;
pub mod watcher;

pub use poller::TaskPoller;
pub use watcher::TaskWatcher;
