//! Gate-0 adapter: external code review of the agent's change.
//!
//! The reviewer command prints a findings JSON array. Reviewer failures never
//! vanish: they become WARNING findings on the gate.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::core::nfr::parse_tool_output;
use crate::core::nfr::OutputFormat;
use crate::core::types::{Finding, Severity};
use crate::io::iteration_log::write_text;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Finding attribution for review output.
pub const REVIEW_CHECK: &str = "review";

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub workdir: PathBuf,
    pub iteration: u64,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Reviewer {
    fn review(&self, request: &ReviewRequest) -> Result<Vec<Finding>>;
}

/// Reviewer spawned from a configured argv.
pub struct CommandReviewer {
    command: Vec<String>,
}

impl CommandReviewer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Reviewer for CommandReviewer {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn review(&self, request: &ReviewRequest) -> Result<Vec<Finding>> {
        let mut cmd = command_from_argv(&self.command, &request.workdir)?;
        cmd.env("FACTORY_ITERATION", request.iteration.to_string());
        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "reviewer could not be started");
                return Ok(vec![Finding::new(
                    REVIEW_CHECK,
                    Severity::Warning,
                    format!("reviewer could not be started: {err:#}"),
                )]);
            }
        };
        write_text(&request.log_path, &output.combined_log("review"))?;
        if output.timed_out {
            return Ok(vec![Finding::new(
                REVIEW_CHECK,
                Severity::Warning,
                format!("reviewer timed out after {}s", request.timeout.as_secs()),
            )]);
        }
        Ok(parse_tool_output(
            REVIEW_CHECK,
            OutputFormat::FindingsJson,
            &output.stdout_text("review"),
            output.status.code(),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> ReviewRequest {
        ReviewRequest {
            workdir: dir.to_path_buf(),
            iteration: 1,
            log_path: dir.join("review.log"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    fn sh(script: &str) -> CommandReviewer {
        CommandReviewer::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn parses_reviewer_findings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let findings = sh(r#"echo '[{"severity":"CRITICAL","message":"hardcoded secret","file":"src/lib.rs","line":4}]'"#)
            .review(&request(temp.path()))
            .expect("review");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].file.as_deref(), Some("src/lib.rs"));
        assert!(temp.path().join("review.log").exists());
    }

    #[test]
    fn missing_reviewer_becomes_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let findings = CommandReviewer::new(vec!["factory-no-such-reviewer".to_string()])
            .review(&request(temp.path()))
            .expect("review");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
    }
}
