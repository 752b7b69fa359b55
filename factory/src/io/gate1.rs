//! Gate-1 adapter for the project's deterministic checks (`just ci` by default).
//!
//! The command is a black box: its exit code alone decides PASS/FAIL.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::DeterministicOutcome;
use crate::io::iteration_log::write_text;
use crate::io::process::{command_from_argv, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct Gate1Request {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait DeterministicGate {
    fn run(&self, request: &Gate1Request) -> Result<DeterministicOutcome>;
}

/// Gate-1 spawned from a configured argv.
pub struct CommandGate1 {
    command: Vec<String>,
}

impl CommandGate1 {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl DeterministicGate for CommandGate1 {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &Gate1Request) -> Result<DeterministicOutcome> {
        info!(command = %self.command.join(" "), "running deterministic checks");
        let cmd = command_from_argv(&self.command, &request.workdir)?;
        let outcome = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => DeterministicOutcome {
                exit_code: output.status.code(),
                timed_out: output.timed_out,
                log: output.combined_log("gate1"),
            },
            Err(err) => DeterministicOutcome {
                exit_code: None,
                timed_out: false,
                log: format!("could not start {}: {err:#}\n", self.command.join(" ")),
            },
        };
        write_text(&request.log_path, &outcome.log)?;
        if !outcome.passed() {
            warn!(exit_code = ?outcome.exit_code, timed_out = outcome.timed_out, "deterministic checks failed");
        }
        Ok(outcome)
    }
}
