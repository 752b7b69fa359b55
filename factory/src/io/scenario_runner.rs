//! Gate-3 scenario execution.
//!
//! Every scenario runs as `<shell...> <evaluation command>` from the project
//! root under a hard timeout. Nothing here returns an error for a failing
//! scenario: timeouts, signals and launch failures are all encoded in the
//! [`ScenarioResult`].

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::scenario::{EXIT_SIGNALED, Scenario, ScenarioResult};
use crate::io::config::ScenariosConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Environment variable pointing scenario commands at the project root.
pub const PROJECT_ROOT_ENV: &str = "FACTORY_PROJECT_ROOT";

#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    root: PathBuf,
    shell: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    parallel: bool,
}

impl ScenarioRunner {
    pub fn new(root: &Path, cfg: &ScenariosConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            shell: cfg.shell.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            parallel: cfg.parallel,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `scenarios` and return one result per scenario, in input order.
    ///
    /// Sequential unless parallel mode is enabled, and even then only
    /// side-effect-free scenarios run concurrently (after the others finish).
    #[instrument(skip_all, fields(count = scenarios.len(), parallel = self.parallel))]
    pub fn run(&self, scenarios: &[Scenario]) -> Vec<ScenarioResult> {
        let mut results: Vec<Option<ScenarioResult>> = vec![None; scenarios.len()];
        let mut concurrent = Vec::new();
        for (idx, scenario) in scenarios.iter().enumerate() {
            if self.parallel && scenario.side_effect_free {
                concurrent.push(idx);
            } else {
                results[idx] = Some(self.run_one(scenario));
            }
        }
        if !concurrent.is_empty() {
            debug!(count = concurrent.len(), "running side-effect-free scenarios concurrently");
            let finished: Vec<(usize, ScenarioResult)> = thread::scope(|scope| {
                let handles: Vec<_> = concurrent
                    .iter()
                    .map(|&idx| {
                        let scenario = &scenarios[idx];
                        (idx, scope.spawn(move || self.run_one(scenario)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(idx, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            ScenarioResult::launch_failed(
                                &scenarios[idx],
                                "scenario worker thread panicked",
                            )
                        });
                        (idx, result)
                    })
                    .collect()
            });
            for (idx, result) in finished {
                results[idx] = Some(result);
            }
        }
        results
            .into_iter()
            .zip(scenarios)
            .map(|(result, scenario)| {
                result.unwrap_or_else(|| ScenarioResult::launch_failed(scenario, "scenario was not run"))
            })
            .collect()
    }

    /// Run a single scenario.
    #[instrument(skip_all, fields(scenario = %scenario.name))]
    pub fn run_one(&self, scenario: &Scenario) -> ScenarioResult {
        let mut argv = self.shell.clone();
        argv.push(scenario.evaluation_command.clone());
        let mut cmd = match command_from_argv(&argv, &self.root) {
            Ok(cmd) => cmd,
            Err(err) => return ScenarioResult::launch_failed(scenario, &format!("{err:#}")),
        };
        cmd.env(PROJECT_ROOT_ENV, &self.root);

        let output = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "scenario command could not be started");
                return ScenarioResult::launch_failed(scenario, &format!("{err:#}"));
            }
        };
        let stdout = output.stdout_text("scenario");
        let stderr = output.stderr_text("scenario");
        let duration = output.elapsed.as_secs_f64();

        let result = if output.timed_out {
            ScenarioResult::timed_out(scenario, self.timeout.as_secs(), duration, stdout, stderr)
        } else {
            let exit_code = output.status.code().unwrap_or(EXIT_SIGNALED);
            ScenarioResult::completed(scenario, exit_code, duration, stdout, stderr)
        };
        info!(
            passed = result.passed,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "scenario finished"
        );
        result
    }
}
