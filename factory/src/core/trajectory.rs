//! Convergence trajectory, failure signatures and stall detection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::record::IterationRecord;
use crate::core::types::{GateFindings, GateId, GateResult, GateStatus, Severity};

const EPSILON: f64 = 1e-9;

/// Shape of the most recent window of satisfaction scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    /// Fewer than two data points.
    Insufficient,
    Improving,
    Plateau,
    Regressing,
    /// Scores went both up and down without net improvement.
    Oscillating,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Insufficient => "insufficient data",
            Trend::Improving => "improving",
            Trend::Plateau => "plateau",
            Trend::Regressing => "regressing",
            Trend::Oscillating => "oscillating",
        }
    }
}

/// Why the loop cannot self-correct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stall {
    /// The same failure signature appeared in every one of the last `window` iterations.
    RepeatedFailure { signature: String, window: usize },
    /// Scores oscillated across the last `window` iterations with no net gain.
    Oscillation { window: usize },
}

impl Stall {
    pub fn describe(&self) -> String {
        match self {
            Stall::RepeatedFailure { signature, window } => {
                format!("same failure in {window} consecutive iterations: {signature}")
            }
            Stall::Oscillation { window } => {
                format!("scores oscillated for {window} iterations without net improvement")
            }
        }
    }
}

/// Ordered satisfaction scores of the records where Gate-3 ran.
pub fn scores(history: &[IterationRecord]) -> Vec<f64> {
    history.iter().filter_map(|r| r.satisfaction_score).collect()
}

/// Classify the last `window` scores (at least two are considered).
pub fn trend(scores: &[f64], window: usize) -> Trend {
    if scores.len() < 2 {
        return Trend::Insufficient;
    }
    let window = window.max(2).min(scores.len());
    let recent = &scores[scores.len() - window..];
    let deltas: Vec<f64> = recent.windows(2).map(|w| w[1] - w[0]).collect();
    let ups = deltas.iter().any(|d| *d > EPSILON);
    let downs = deltas.iter().any(|d| *d < -EPSILON);
    let net = recent[recent.len() - 1] - recent[0];
    match (ups, downs) {
        (false, false) => Trend::Plateau,
        (true, true) if net > EPSILON => Trend::Improving,
        (true, true) => Trend::Oscillating,
        _ if net > EPSILON => Trend::Improving,
        _ if net < -EPSILON => Trend::Regressing,
        _ => Trend::Plateau,
    }
}

/// Stall detection over the full history, current iteration last.
pub fn detect_stall(history: &[IterationRecord], window: usize) -> Option<Stall> {
    let window = window.max(2);
    if history.len() < window {
        return None;
    }
    let recent = &history[history.len() - window..];

    let mut common: BTreeSet<&str> = recent[0]
        .failure_signatures
        .iter()
        .map(String::as_str)
        .collect();
    for record in &recent[1..] {
        let sigs: BTreeSet<&str> = record.failure_signatures.iter().map(String::as_str).collect();
        common = common.intersection(&sigs).copied().collect();
    }
    if let Some(signature) = common.into_iter().next() {
        return Some(Stall::RepeatedFailure {
            signature: signature.to_string(),
            window,
        });
    }

    if trend(&scores(recent), window) == Trend::Oscillating {
        return Some(Stall::Oscillation { window });
    }
    None
}

/// Signatures of the blocking failures in one iteration's gate results.
///
/// Scenario failures are keyed by scenario name plus normalized error summary;
/// gate failures by gate plus their most telling line.
pub fn failure_signatures(gate_results: &[GateResult]) -> Vec<String> {
    let mut out = BTreeSet::new();
    for result in gate_results {
        if result.status != GateStatus::Fail || !result.blocking {
            continue;
        }
        match &result.findings {
            GateFindings::Scenarios { summary } => {
                for failure in summary.failures() {
                    let detail = failure.error_summary.as_deref().unwrap_or("");
                    out.insert(format!(
                        "scenario:{}|{}",
                        failure.scenario_name,
                        normalize(detail)
                    ));
                }
                if summary.total == 0 {
                    out.insert("scenario:<none>|no scenarios discovered".to_string());
                }
            }
            GateFindings::Deterministic { outcome } => {
                let detail = if outcome.timed_out {
                    "timed out".to_string()
                } else {
                    crate::core::scenario::extract_error_summary(&outcome.log, "")
                };
                out.insert(format!("{}|{}", gate_key(result.gate), normalize(&detail)));
            }
            GateFindings::Review { findings } => {
                for finding in findings.iter().filter(|f| f.severity == Severity::Critical) {
                    out.insert(format!(
                        "{}|{}|{}",
                        gate_key(result.gate),
                        finding.check,
                        normalize(&finding.message)
                    ));
                }
            }
            GateFindings::ScenarioSetRejected { error } => {
                out.insert(format!("{}|rejected|{}", gate_key(result.gate), normalize(error)));
            }
            GateFindings::NonFunctional { .. } | GateFindings::Skipped { .. } => {}
        }
    }
    out.into_iter().collect()
}

fn gate_key(gate: GateId) -> &'static str {
    match gate {
        GateId::Gate0 => "gate0",
        GateId::Gate1 => "gate1",
        GateId::Gate2 => "gate2",
        GateId::Gate3 => "gate3",
    }
}

/// Replace digit runs with `N` and collapse whitespace so timings and
/// addresses do not defeat signature matching.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('N');
            }
            in_digits = true;
            continue;
        }
        in_digits = false;
        out.push(ch);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
