//! NFR check wrapping an external static-analysis tool.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::core::nfr::{NfrCheckReport, OutputFormat, parse_tool_output};
use crate::io::nfr::NfrCheck;
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub struct ToolCheck {
    name: String,
    command: Vec<String>,
    format: OutputFormat,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ToolCheck {
    pub fn new(
        name: &str,
        command: Vec<String>,
        format: OutputFormat,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            command,
            format,
            timeout,
            output_limit_bytes,
        }
    }
}

impl NfrCheck for ToolCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn tool(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    #[instrument(skip_all, fields(check = %self.name))]
    fn run(&self, root: &Path) -> Result<NfrCheckReport> {
        let cmd = command_from_argv(&self.command, root)?;
        let output = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "nfr tool could not be started");
                return Ok(NfrCheckReport::errored(
                    &self.name,
                    self.tool(),
                    format!("could not run {}: {err:#}", self.tool()),
                ));
            }
        };
        if output.timed_out {
            return Ok(NfrCheckReport::errored(
                &self.name,
                self.tool(),
                format!("{} timed out after {}s", self.tool(), self.timeout.as_secs()),
            ));
        }
        let findings = parse_tool_output(
            &self.name,
            self.format,
            &output.stdout_text(&self.name),
            output.status.code(),
        );
        Ok(NfrCheckReport::from_findings(self.tool(), findings))
    }
}
