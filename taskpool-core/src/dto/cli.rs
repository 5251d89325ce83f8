//! Exit codes of the coordinator's command-line surface
//!
//! Worker nodes that reach the coordinator by invoking its executable map
//! these back to typed store errors. Every data subcommand prints exactly one
//! JSON document on stdout when it exits with `EXIT_OK`.

pub const EXIT_OK: u8 = 0;

/// Any failure without a more specific code
pub const EXIT_FAILURE: u8 = 1;

/// The calling node no longer holds the lease on the task
pub const EXIT_LEASE_LOST: u8 = 3;

/// The task does not exist
pub const EXIT_NOT_FOUND: u8 = 4;
