//! Scenario data model and scoring.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code recorded for a scenario killed by the wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = -1;
/// Exit code recorded for a scenario whose command could not be started.
pub const EXIT_LAUNCH_FAILED: i32 = -2;
/// Exit code recorded when the process ended without a code (killed by a signal).
pub const EXIT_SIGNALED: i32 = -3;

/// Behavioral area a scenario exercises.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScenarioCategory {
    Api,
    Cli,
    Integration,
    Performance,
    Security,
    Ui,
    Other(String),
}

impl ScenarioCategory {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "api" => ScenarioCategory::Api,
            "cli" => ScenarioCategory::Cli,
            "integration" => ScenarioCategory::Integration,
            "performance" | "perf" => ScenarioCategory::Performance,
            "security" => ScenarioCategory::Security,
            "ui" | "web" | "browser" => ScenarioCategory::Ui,
            _ => ScenarioCategory::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ScenarioCategory::Api => "api",
            ScenarioCategory::Cli => "cli",
            ScenarioCategory::Integration => "integration",
            ScenarioCategory::Performance => "performance",
            ScenarioCategory::Security => "security",
            ScenarioCategory::Ui => "ui",
            ScenarioCategory::Other(name) => name,
        }
    }
}

impl fmt::Display for ScenarioCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ScenarioCategory {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ScenarioCategory {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ScenarioCategory::parse(&raw))
    }
}

/// A behavioral check parsed from a holdout definition file. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub category: ScenarioCategory,
    pub preconditions: String,
    pub behavioral_expectation: String,
    pub evaluation_command: String,
    pub pass_criteria: String,
    pub evidence_required: Vec<String>,
    /// Declared free of shared side effects; eligible for parallel execution.
    pub side_effect_free: bool,
    /// Path of the definition file relative to the project root.
    pub source: String,
}

/// Outcome of running one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub category: ScenarioCategory,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub stdout: String,
    pub stderr: String,
    pub passed: bool,
    pub timed_out: bool,
    pub error_summary: Option<String>,
}

impl ScenarioResult {
    /// Build a result from a finished process; `passed` is derived from the exit code.
    pub fn completed(
        scenario: &Scenario,
        exit_code: i32,
        duration_seconds: f64,
        stdout: String,
        stderr: String,
    ) -> Self {
        let passed = exit_code == 0;
        let error_summary = (!passed).then(|| extract_error_summary(&stdout, &stderr));
        Self {
            scenario_name: scenario.name.clone(),
            category: scenario.category.clone(),
            exit_code,
            duration_seconds,
            stdout,
            stderr,
            passed,
            timed_out: false,
            error_summary,
        }
    }

    pub fn timed_out(
        scenario: &Scenario,
        timeout_secs: u64,
        duration_seconds: f64,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self {
            scenario_name: scenario.name.clone(),
            category: scenario.category.clone(),
            exit_code: EXIT_TIMEOUT,
            duration_seconds,
            stdout,
            stderr,
            passed: false,
            timed_out: true,
            error_summary: Some(format!("Timeout after {timeout_secs}s")),
        }
    }

    pub fn launch_failed(scenario: &Scenario, os_error: &str) -> Self {
        let stderr = format!("failed to start evaluation command: {os_error}");
        Self {
            scenario_name: scenario.name.clone(),
            category: scenario.category.clone(),
            exit_code: EXIT_LAUNCH_FAILED,
            duration_seconds: 0.0,
            stdout: String::new(),
            error_summary: Some(stderr.clone()),
            stderr,
            passed: false,
            timed_out: false,
        }
    }
}

/// Aggregate of one scenario run. Hand-off contract between Gate-3 and feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// `passed / total`, unrounded; `0.0` when there are no scenarios.
    pub satisfaction_score: f64,
    pub timestamp: String,
    pub results: Vec<ScenarioResult>,
}

impl ScenarioRunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Summarize results. `timestamp` is supplied by the caller to keep this pure.
pub fn summarize(results: Vec<ScenarioResult>, timestamp: &str) -> ScenarioRunSummary {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    ScenarioRunSummary {
        total,
        passed,
        failed: total - passed,
        satisfaction_score: satisfaction_score(passed, total),
        timestamp: timestamp.to_string(),
        results,
    }
}

pub fn satisfaction_score(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    passed as f64 / total as f64
}

const ERROR_MARKERS: [&str; 7] = [
    "error",
    "assert",
    "fail",
    "traceback",
    "panic",
    "exception",
    "not found",
];

/// Pick the most telling line of a failure's output.
///
/// Scans stdout then stderr from the end for a line mentioning an error marker;
/// falls back to the last non-empty line, then to `"Unknown error"`.
pub fn extract_error_summary(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let marked = lines.iter().rev().find(|line| {
        let lower = line.to_ascii_lowercase();
        ERROR_MARKERS.iter().any(|m| lower.contains(m))
    });
    match marked.or_else(|| lines.last()) {
        Some(line) => truncate_line(line, 240),
        None => "Unknown error".to_string(),
    }
}

fn truncate_line(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
