//! Shared deterministic types for factory core logic.
//!
//! These types define the hand-off contracts between gates. They carry no I/O
//! and serialize to stable JSON for the per-iteration artifacts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::nfr::NfrReport;
use crate::core::scenario::ScenarioRunSummary;

/// Finding severity. Ordering is total: `Critical > Warning > Nit > Info`.
///
/// Variants are declared in ascending order so the derived `Ord` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Nit,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Nit => "NIT",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Parse a tool-provided severity label, case-insensitively.
    ///
    /// Common synonyms from linters are accepted (`error`, `high`, `medium`, `low`, `note`).
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" | "error" | "high" | "blocker" => Some(Severity::Critical),
            "warning" | "warn" | "medium" => Some(Severity::Warning),
            "nit" | "low" | "minor" | "style" => Some(Severity::Nit),
            "info" | "note" | "help" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One static-analysis or review observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Name of the check (or reviewer) that produced the finding.
    pub check: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

impl Finding {
    pub fn new(check: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            severity,
            file: None,
            line: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line.filter(|l| *l > 0);
        self
    }

    /// `file:line` (or just `file`) when a location is known.
    pub fn location(&self) -> Option<String> {
        let file = self.file.as_ref()?;
        Some(match self.line {
            Some(line) => format!("{file}:{line}"),
            None => file.clone(),
        })
    }
}

/// Sort findings by severity descending, then by check, location and message.
pub fn sort_by_severity(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.check.cmp(&b.check))
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line.cmp(&b.line))
            .then_with(|| a.message.cmp(&b.message))
    });
}

/// Identifier of a validation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateId {
    /// External review of the agent's change.
    Gate0,
    /// Deterministic checks (lint, typecheck, tests) via the build system.
    Gate1,
    /// Non-functional requirement checks.
    Gate2,
    /// Holdout scenario evaluation.
    Gate3,
}

impl GateId {
    pub const ALL: [GateId; 4] = [GateId::Gate0, GateId::Gate1, GateId::Gate2, GateId::Gate3];

    /// Gate-0, Gate-1 and Gate-3 block convergence; Gate-2 never does.
    pub fn is_blocking(self) -> bool {
        !matches!(self, GateId::Gate2)
    }

    pub fn title(self) -> &'static str {
        match self {
            GateId::Gate0 => "Gate-0 review",
            GateId::Gate1 => "Gate-1 deterministic checks",
            GateId::Gate2 => "Gate-2 non-functional checks",
            GateId::Gate3 => "Gate-3 scenarios",
        }
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            GateId::Gate0 => 0,
            GateId::Gate1 => 1,
            GateId::Gate2 => 2,
            GateId::Gate3 => 3,
        };
        write!(f, "Gate-{n}")
    }
}

/// Outcome classification of one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Fail,
    Skipped,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
            GateStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of the external deterministic-check command (Gate-1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Combined stdout/stderr of the check command.
    pub log: String,
}

impl DeterministicOutcome {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Gate-specific evidence attached to a [`GateResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateFindings {
    Review { findings: Vec<Finding> },
    Deterministic { outcome: DeterministicOutcome },
    NonFunctional { report: NfrReport },
    Scenarios { summary: ScenarioRunSummary },
    /// Gate-3 could not score: a scenario document is malformed or the
    /// summary lost scenarios. Carries the error only, never scenario bodies.
    ScenarioSetRejected { error: String },
    Skipped { reason: String },
}

/// Outcome of one gate in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateId,
    pub status: GateStatus,
    pub blocking: bool,
    pub findings: GateFindings,
}

impl GateResult {
    pub fn new(gate: GateId, status: GateStatus, findings: GateFindings) -> Self {
        Self {
            gate,
            status,
            blocking: gate.is_blocking(),
            findings,
        }
    }

    pub fn skipped(gate: GateId, reason: impl Into<String>) -> Self {
        Self::new(
            gate,
            GateStatus::Skipped,
            GateFindings::Skipped {
                reason: reason.into(),
            },
        )
    }

    /// The rejection error when this gate could not evaluate its scenario set.
    pub fn rejection(&self) -> Option<&str> {
        match &self.findings {
            GateFindings::ScenarioSetRejected { error } => Some(error.as_str()),
            _ => None,
        }
    }

    /// True when this gate failed and its policy is blocking.
    pub fn blocks(&self) -> bool {
        self.blocking && self.status == GateStatus::Fail
    }
}
