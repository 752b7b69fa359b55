//! Stable exit codes for factory CLI commands.

use crate::error::{ConfigError, IsolationError};

/// Command succeeded, or the iteration converged.
pub const OK: i32 = 0;
/// Scenarios or gates failed, the iteration looped, or any other error.
pub const FAILURE: i32 = 1;
/// Invalid configuration or usage.
pub const INVALID: i32 = 2;
/// Holdout isolation or its verification failed.
pub const ISOLATION: i32 = 3;
/// The judge escalated to a human.
pub const ESCALATE: i32 = 4;

/// Map a command error to its exit code.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        INVALID
    } else if err.downcast_ref::<IsolationError>().is_some() {
        ISOLATION
    } else {
        FAILURE
    }
}
