//! Factory configuration stored under `.factory/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::judge::{Criterion, JudgePolicy};
use crate::core::nfr::OutputFormat;
use crate::error::ConfigError;
use crate::io::atomic::write_atomic;

/// Factory configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FactoryConfig {
    /// Iterations after which a non-converged loop escalates.
    pub max_iterations: u64,
    pub holdout: HoldoutConfig,
    pub agent: AgentConfig,
    pub review: ReviewConfig,
    pub gate1: Gate1Config,
    pub scenarios: ScenariosConfig,
    pub nfr: NfrConfig,
    pub judge: JudgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HoldoutConfig {
    /// Holdout directory relative to the project root.
    pub dir: String,
    /// Build file whose targets reference the holdout.
    pub build_file: String,
    pub build_targets: Vec<String>,
    /// Generated files removed on strip and never restored.
    pub ancillary_paths: Vec<String>,
    /// Fixed snapshot to restore from; defaults to the pre-strip HEAD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_ref: Option<String>,
}

impl Default for HoldoutConfig {
    fn default() -> Self {
        Self {
            dir: "scenarios".to_string(),
            build_file: "Makefile".to_string(),
            build_targets: vec!["run-scenarios".to_string(), "compile-feedback".to_string()],
            ancillary_paths: Vec::new(),
            restore_ref: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command for the external coding agent; receives the feedback document on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Reviewer command printing a findings JSON array; empty skips Gate-0.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Gate1Config {
    /// Deterministic check command (e.g. `["just","ci"]`); exit code decides.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for Gate1Config {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScenariosConfig {
    /// Shell prefix; the evaluation command is appended as the last argument.
    pub shell: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Run side-effect-free scenarios concurrently.
    pub parallel: bool,
}

impl Default for ScenariosConfig {
    fn default() -> Self {
        Self {
            shell: vec!["bash".to_string(), "-c".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 100_000,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NfrConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Register the built-in test-quality scan.
    pub test_quality: bool,
    pub checks: Vec<ToolCheckConfig>,
}

impl Default for NfrConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            output_limit_bytes: 1_000_000,
            test_quality: true,
            checks: Vec::new(),
        }
    }
}

/// One external static-analysis tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCheckConfig {
    pub name: String,
    pub command: Vec<String>,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgeConfig {
    pub criterion: Criterion,
    /// Used only with `criterion = "threshold"`.
    pub threshold: f64,
    /// Consecutive iterations considered by stall detection.
    pub stall_window: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            criterion: Criterion::AllPass,
            threshold: 0.8,
            stall_window: 3,
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            holdout: HoldoutConfig::default(),
            agent: AgentConfig::default(),
            review: ReviewConfig::default(),
            gate1: Gate1Config::default(),
            scenarios: ScenariosConfig::default(),
            nfr: NfrConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigError(msg.into()))
}

fn non_empty_command(name: &str, command: &[String]) -> Result<()> {
    if command.is_empty() || command[0].trim().is_empty() {
        return Err(invalid(format!("{name} must be a non-empty array")));
    }
    Ok(())
}

impl FactoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be > 0"));
        }
        let dir = self.holdout.dir.trim().trim_end_matches('/');
        if dir.is_empty() || dir == "." || dir.starts_with('/') || dir.split('/').any(|c| c == "..")
        {
            return Err(invalid(
                "holdout.dir must be a relative path inside the project",
            ));
        }
        if dir == crate::io::paths::FACTORY_DIR || dir.starts_with(".factory/") {
            return Err(invalid("holdout.dir must not live under .factory"));
        }
        non_empty_command("agent.command", &self.agent.command)?;
        non_empty_command("gate1.command", &self.gate1.command)?;
        non_empty_command("scenarios.shell", &self.scenarios.shell)?;
        for (name, secs) in [
            ("agent.timeout_secs", self.agent.timeout_secs),
            ("review.timeout_secs", self.review.timeout_secs),
            ("gate1.timeout_secs", self.gate1.timeout_secs),
            ("scenarios.timeout_secs", self.scenarios.timeout_secs),
            ("nfr.timeout_secs", self.nfr.timeout_secs),
        ] {
            if secs == 0 {
                return Err(invalid(format!("{name} must be > 0")));
            }
        }
        for (name, limit) in [
            ("agent.output_limit_bytes", self.agent.output_limit_bytes),
            ("gate1.output_limit_bytes", self.gate1.output_limit_bytes),
            ("scenarios.output_limit_bytes", self.scenarios.output_limit_bytes),
            ("nfr.output_limit_bytes", self.nfr.output_limit_bytes),
        ] {
            if limit == 0 {
                return Err(invalid(format!("{name} must be > 0")));
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for check in &self.nfr.checks {
            if check.name.trim().is_empty() {
                return Err(invalid("nfr.checks[].name must be non-empty"));
            }
            if !names.insert(check.name.as_str())
                || (self.nfr.test_quality && check.name == crate::core::test_quality::CHECK_NAME)
            {
                return Err(invalid(format!("duplicate nfr check name '{}'", check.name)));
            }
            non_empty_command(&format!("nfr.checks.{}.command", check.name), &check.command)?;
        }
        if !(self.judge.threshold > 0.0 && self.judge.threshold <= 1.0) {
            return Err(invalid("judge.threshold must be in (0, 1]"));
        }
        if self.judge.stall_window < 2 {
            return Err(invalid("judge.stall_window must be >= 2"));
        }
        Ok(())
    }

    pub fn judge_policy(&self) -> JudgePolicy {
        JudgePolicy {
            criterion: self.judge.criterion,
            threshold: self.judge.threshold,
            max_iterations: self.max_iterations,
        }
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_secs(self.scenarios.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FactoryConfig::default()`.
pub fn load_config(path: &Path) -> Result<FactoryConfig> {
    if !path.exists() {
        let cfg = FactoryConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FactoryConfig = toml::from_str(&contents)
        .map_err(|err| invalid(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FactoryConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
