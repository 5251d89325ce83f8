//! Taskpool Core
//!
//! Core types shared by the coordinator and worker nodes.
//!
//! This crate contains:
//! - Domain types: tasks, their lifecycle and the canonical result record
//! - DTOs: request/response bodies for the coordinator API
//! - Protocol: the normalizer that turns raw process output into a `TaskResult`

pub mod domain;
pub mod dto;
pub mod protocol;
