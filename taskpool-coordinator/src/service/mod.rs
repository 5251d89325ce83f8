//! Service Module
//!
//! Business logic layer for the coordinator: validation, the claim protocol
//! and lease expiry.

pub mod task;

pub use task as task_service;
