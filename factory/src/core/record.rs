//! Persisted per-iteration record, the basis for trajectory analysis.

use serde::{Deserialize, Serialize};

use crate::core::judge::Decision;
use crate::core::scenario::ScenarioRunSummary;
use crate::core::types::{GateFindings, GateId, GateResult};

/// One entry of the append-only iteration log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u64,
    pub timestamp: String,
    pub gate_results: Vec<GateResult>,
    /// Gate-3 satisfaction score; `None` when scenarios did not run, which
    /// keeps the iteration out of the trajectory.
    #[serde(default)]
    pub satisfaction_score: Option<f64>,
    pub decision: Decision,
    /// Normalized signatures of this iteration's blocking failures.
    #[serde(default)]
    pub failure_signatures: Vec<String>,
    /// Snapshot the holdout was restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_ref: Option<String>,
    /// Commit recording the agent's merged change, if anything changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_exit_code: Option<i32>,
}

impl IterationRecord {
    pub fn gate(&self, gate: GateId) -> Option<&GateResult> {
        self.gate_results.iter().find(|r| r.gate == gate)
    }

    /// Scenario results of this iteration, when Gate-3 ran.
    pub fn scenario_summary(&self) -> Option<&ScenarioRunSummary> {
        match &self.gate(GateId::Gate3)?.findings {
            GateFindings::Scenarios { summary } => Some(summary),
            _ => None,
        }
    }
}
