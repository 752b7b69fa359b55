//! Convergence judgment: CONVERGED, LOOP or ESCALATE.

use serde::{Deserialize, Serialize};

use crate::core::scenario::ScenarioRunSummary;
use crate::core::trajectory::{Stall, Trend};
use crate::core::types::{GateId, GateResult, GateStatus};

/// Acceptance criterion for Gate-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Every scenario must pass (`satisfaction_score == 1.0`).
    #[default]
    AllPass,
    /// `satisfaction_score >= threshold`.
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JudgePolicy {
    pub criterion: Criterion,
    pub threshold: f64,
    pub max_iterations: u64,
}

/// Terminal decision of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Converged,
    Loop,
    Escalate,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Converged => "converged",
            Decision::Loop => "loop",
            Decision::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reasons: Vec<String>,
}

/// Gate-3 status under `policy`. An empty scenario set never passes.
pub fn scenario_gate_status(policy: &JudgePolicy, summary: &ScenarioRunSummary) -> GateStatus {
    if summary.total == 0 {
        return GateStatus::Fail;
    }
    let met = match policy.criterion {
        Criterion::AllPass => summary.failed == 0,
        Criterion::Threshold => summary.satisfaction_score >= policy.threshold,
    };
    if met { GateStatus::Pass } else { GateStatus::Fail }
}

/// Inputs to [`judge`] for the iteration being decided.
#[derive(Debug, Clone)]
pub struct JudgeInput<'a> {
    pub iteration: u64,
    pub gate_results: &'a [GateResult],
    pub trend: Trend,
    pub stall: Option<&'a Stall>,
}

/// Decide the iteration outcome.
///
/// Converges only when no blocking gate failed and Gate-1 and Gate-3 both
/// passed; a regressing trajectory downgrades that to LOOP. A stall or the
/// iteration cap turns a LOOP into ESCALATE, and so does a
/// rejected scenario set, which no agent change can repair. Gate-2 never blocks.
pub fn judge(policy: &JudgePolicy, input: &JudgeInput<'_>) -> Verdict {
    let mut reasons = Vec::new();
    let status = |gate: GateId| {
        input
            .gate_results
            .iter()
            .find(|r| r.gate == gate)
            .map(|r| r.status)
            .unwrap_or(GateStatus::Skipped)
    };

    for result in input.gate_results.iter().filter(|r| r.blocks()) {
        reasons.push(format!("{} failed", result.gate));
    }
    for gate in [GateId::Gate1, GateId::Gate3] {
        if status(gate) == GateStatus::Skipped {
            reasons.push(format!("{gate} did not run"));
        }
    }

    if reasons.is_empty() {
        if input.trend == Trend::Regressing {
            reasons.push("satisfaction trajectory is regressing".to_string());
        } else {
            return Verdict {
                decision: Decision::Converged,
                reasons: vec!["all blocking gates passed".to_string()],
            };
        }
    }

    if let Some(error) = input.gate_results.iter().find_map(GateResult::rejection) {
        reasons.push(format!("scenario set rejected, the holdout needs a human fix: {error}"));
        return Verdict {
            decision: Decision::Escalate,
            reasons,
        };
    }
    if let Some(stall) = input.stall {
        reasons.push(format!("stalled: {}", stall.describe()));
        return Verdict {
            decision: Decision::Escalate,
            reasons,
        };
    }
    if input.iteration >= policy.max_iterations {
        reasons.push(format!(
            "reached max_iterations ({}) without converging",
            policy.max_iterations
        ));
        return Verdict {
            decision: Decision::Escalate,
            reasons,
        };
    }
    Verdict {
        decision: Decision::Loop,
        reasons,
    }
}
