//! Core domain types
//!
//! These types are shared between the coordinator (which persists them) and
//! worker nodes (which claim and execute them).

pub mod result;
pub mod task;
