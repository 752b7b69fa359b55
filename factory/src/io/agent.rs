//! Adapter for the external coding agent.
//!
//! The [`Agent`] trait decouples orchestration from the agent backend. The
//! agent works on the stripped tree and receives the latest feedback document
//! on stdin. Tests use scripted agents that edit files directly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::iteration_log::write_text;
use crate::io::process::{command_from_argv, run_command_with_stream};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    pub iteration: u64,
    /// Feedback document from the previous iteration (empty on the first).
    pub feedback: String,
    pub log_path: PathBuf,
    /// When set, stdout is copied here line by line while the agent runs.
    pub stream_path: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// How the agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl AgentRun {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait Agent {
    /// Run the agent to completion. A nonzero exit is reported, not an error.
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Agent spawned from a configured argv.
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        info!(command = %self.command.join(" "), "starting agent");
        let mut cmd = command_from_argv(&self.command, &request.workdir)?;
        cmd.env("FACTORY_ITERATION", request.iteration.to_string());

        let output = run_command_with_stream(
            cmd,
            Some(request.feedback.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.stream_path.as_deref(),
        )
        .with_context(|| format!("run agent {}", self.command.join(" ")))?;
        write_text(&request.log_path, &output.combined_log("agent"))?;

        let run = AgentRun {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        };
        if !run.succeeded() {
            warn!(exit_code = ?run.exit_code, timed_out = run.timed_out, "agent did not exit cleanly");
        }
        Ok(run)
    }
}
