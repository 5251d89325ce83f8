//! Data Transfer Objects for coordinator communication
//!
//! Request and response bodies exchanged between worker nodes and the
//! coordinator, over HTTP or through its command-line surface.

pub mod cli;
pub mod task;
