//! Convergence validation for agent-written code.
//!
//! The factory hides a holdout set of behavioral scenarios from a coding
//! agent, lets the agent work, restores the holdout and grades the result
//! through four gates before a judge decides whether to converge, loop with
//! feedback, or escalate to a human. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scenario parsing, scoring,
//!   trajectory analysis, judging, feedback compilation). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, subprocesses,
//!   durable state). Collaborators sit behind traits so tests can script them.
//!
//! Orchestration modules ([`orchestrator`], [`looping`], [`recover`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
pub mod recover;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
