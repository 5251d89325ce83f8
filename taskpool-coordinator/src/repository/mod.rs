//! Repository Module
//!
//! Data access layer for the coordinator.

pub mod task;

pub use task as task_repository;
