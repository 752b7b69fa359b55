//! Feedback compilation: the only channel back to the coding agent.
//!
//! Failure evidence is reproduced verbatim (scenario stdout/stderr, every
//! non-INFO finding, gate logs). Only the root-cause grouping is inferred.
//! Scenario evaluation commands, pass criteria and preconditions never appear:
//! [`ScenarioResult`] does not carry them.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::judge::{Decision, Verdict};
use crate::core::nfr::NfrReport;
use crate::core::record::IterationRecord;
use crate::core::root_cause::{RootCause, RootCauseCategory, RootCauseRule, classify, infer_root_causes};
use crate::core::scenario::{ScenarioCategory, ScenarioResult, ScenarioRunSummary};
use crate::core::trajectory::{Trend, trend};
use crate::core::types::{Finding, GateFindings, GateId, GateResult, GateStatus, Severity};

/// One point of the satisfaction trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub iteration: u64,
    pub score: f64,
}

/// Full evidence for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureDetail {
    Scenario {
        name: String,
        category: ScenarioCategory,
        exit_code: i32,
        duration_seconds: f64,
        timed_out: bool,
        error_summary: Option<String>,
        stdout: String,
        stderr: String,
        root_cause: RootCauseCategory,
    },
    Gate {
        gate: GateId,
        exit_code: Option<i32>,
        timed_out: bool,
        log: String,
        root_cause: RootCauseCategory,
    },
    Finding {
        gate: GateId,
        finding: Finding,
    },
    Rejected {
        gate: GateId,
        error: String,
    },
}

impl FailureDetail {
    fn priority(&self) -> (u8, RootCauseCategory) {
        match self {
            FailureDetail::Finding { gate, finding } if *gate == GateId::Gate0 => {
                let rank = if finding.severity == Severity::Critical { 0 } else { 3 };
                (rank, RootCauseCategory::Uncategorized)
            }
            FailureDetail::Rejected { .. } => (1, RootCauseCategory::Uncategorized),
            FailureDetail::Gate { root_cause, .. } => (1, *root_cause),
            FailureDetail::Scenario { root_cause, .. } => (2, *root_cause),
            FailureDetail::Finding { .. } => (4, RootCauseCategory::Uncategorized),
        }
    }
}

/// Derived, recomputable feedback artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDocument {
    pub iteration: u64,
    pub generated_at: String,
    pub summary: Vec<String>,
    pub trajectory: Vec<TrajectoryPoint>,
    pub trend: Trend,
    pub likely_root_causes: Vec<RootCause>,
    pub failure_details: Vec<FailureDetail>,
    pub priority_instructions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

/// Everything [`compile`] consumes.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackInput<'a> {
    pub iteration: u64,
    pub generated_at: &'a str,
    pub summary: Option<&'a ScenarioRunSummary>,
    pub nfr: Option<&'a NfrReport>,
    pub gate_results: &'a [GateResult],
    /// Records of earlier iterations, oldest first (current excluded).
    pub history: &'a [IterationRecord],
    pub verdict: Option<&'a Verdict>,
    pub trend_window: usize,
}

pub fn compile(rules: &[RootCauseRule], input: &FeedbackInput<'_>) -> FeedbackDocument {
    let mut trajectory: Vec<TrajectoryPoint> = input
        .history
        .iter()
        .filter_map(|r| {
            Some(TrajectoryPoint {
                iteration: r.iteration,
                score: r.satisfaction_score?,
            })
        })
        .collect();
    if let Some(summary) = input.summary {
        trajectory.push(TrajectoryPoint {
            iteration: input.iteration,
            score: summary.satisfaction_score,
        });
    }
    let scores: Vec<f64> = trajectory.iter().map(|p| p.score).collect();
    let trend = trend(&scores, input.trend_window);

    let mut details = Vec::new();
    let mut cause_inputs: Vec<(String, String)> = Vec::new();

    for result in input.gate_results {
        match &result.findings {
            GateFindings::Review { findings } => {
                for finding in findings.iter().filter(|f| f.severity > Severity::Info) {
                    details.push(FailureDetail::Finding {
                        gate: result.gate,
                        finding: finding.clone(),
                    });
                }
            }
            GateFindings::ScenarioSetRejected { error } => {
                details.push(FailureDetail::Rejected {
                    gate: result.gate,
                    error: error.clone(),
                });
            }
            GateFindings::Deterministic { outcome } if result.status == GateStatus::Fail => {
                let text = if outcome.timed_out {
                    format!("Timeout\n{}", outcome.log)
                } else {
                    outcome.log.clone()
                };
                let root_cause = classify(rules, &text);
                cause_inputs.push((result.gate.to_string(), text));
                details.push(FailureDetail::Gate {
                    gate: result.gate,
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                    log: outcome.log.clone(),
                    root_cause,
                });
            }
            _ => {}
        }
    }

    if let Some(summary) = input.summary {
        for failure in summary.failures() {
            let text = failure_text(failure);
            let root_cause = classify(rules, &text);
            cause_inputs.push((failure.scenario_name.clone(), text));
            details.push(scenario_detail(failure, root_cause));
        }
    }

    if let Some(nfr) = input.nfr {
        for finding in nfr.actionable() {
            details.push(FailureDetail::Finding {
                gate: GateId::Gate2,
                finding: finding.clone(),
            });
        }
    }

    details.sort_by_key(FailureDetail::priority);

    let likely_root_causes = infer_root_causes(
        rules,
        cause_inputs.iter().map(|(name, text)| (name.as_str(), text.as_str())),
    );
    let priority_instructions = instructions(input, &likely_root_causes);

    FeedbackDocument {
        iteration: input.iteration,
        generated_at: input.generated_at.to_string(),
        summary: summary_lines(input),
        trajectory,
        trend,
        likely_root_causes,
        failure_details: details,
        priority_instructions,
        decision: input.verdict.map(|v| v.decision),
    }
}

fn failure_text(result: &ScenarioResult) -> String {
    let mut text = String::new();
    if result.timed_out {
        text.push_str("Timeout\n");
    }
    if let Some(summary) = &result.error_summary {
        text.push_str(summary);
        text.push('\n');
    }
    text.push_str(&result.stderr);
    text.push('\n');
    text.push_str(&result.stdout);
    text
}

fn scenario_detail(result: &ScenarioResult, root_cause: RootCauseCategory) -> FailureDetail {
    FailureDetail::Scenario {
        name: result.scenario_name.clone(),
        category: result.category.clone(),
        exit_code: result.exit_code,
        duration_seconds: result.duration_seconds,
        timed_out: result.timed_out,
        error_summary: result.error_summary.clone(),
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        root_cause,
    }
}

fn summary_lines(input: &FeedbackInput<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    match input.summary {
        Some(summary) => {
            lines.push(format!(
                "Satisfaction score: {:.1}% ({}/{} scenarios passed)",
                summary.satisfaction_score * 100.0,
                summary.passed,
                summary.total
            ));
            lines.push(format!(
                "Passed: {} | Failed: {} | Total: {}",
                summary.passed, summary.failed, summary.total
            ));
        }
        None if input.gate_results.iter().any(|r| r.rejection().is_some()) => lines.push(
            "No scenario results: the scenario set was rejected before anything ran.".to_string(),
        ),
        None => lines.push(
            "No scenario results: scenarios did not run this iteration (an earlier gate failed)."
                .to_string(),
        ),
    }
    for result in input.gate_results {
        lines.push(format!("{}: {}", result.gate.title(), result.status.as_str()));
    }
    if let Some(nfr) = input.nfr {
        lines.push(format!(
            "NFR findings: {} critical, {} warning, {} nit (non-blocking)",
            nfr.counts.critical, nfr.counts.warning, nfr.counts.nit
        ));
    }
    if let Some(verdict) = input.verdict {
        lines.push(format!("Decision: {}", verdict.decision.as_str()));
        for reason in &verdict.reasons {
            lines.push(format!("- {reason}"));
        }
    }
    lines
}

fn instructions(input: &FeedbackInput<'_>, causes: &[RootCause]) -> Vec<String> {
    let mut out = Vec::new();
    let gate_failed = |gate: GateId| {
        input
            .gate_results
            .iter()
            .any(|r| r.gate == gate && r.status == GateStatus::Fail)
    };
    if gate_failed(GateId::Gate0) {
        out.push("Resolve every CRITICAL review finding before anything else.".to_string());
    }
    if gate_failed(GateId::Gate1) {
        out.push(
            "Make the deterministic checks (lint, typecheck, tests) pass; scenarios only run after they do."
                .to_string(),
        );
    }
    if input.gate_results.iter().any(|r| r.rejection().is_some()) {
        out.push(
            "The scenario set could not be evaluated; this needs an operator, not a code change."
                .to_string(),
        );
    }
    for cause in causes {
        out.push(format!(
            "{} ({}): {}",
            cause.category.label(),
            cause.affected.join(", "),
            cause.explanation
        ));
    }
    if input.nfr.is_some_and(NfrReport::has_failures) {
        out.push(
            "Address non-functional findings once blocking failures are fixed; they do not block convergence."
                .to_string(),
        );
    }
    if out.is_empty() {
        out.push("All blocking gates passed; keep the change set stable.".to_string());
    }
    out.push("Keep changes minimal: fix what is broken, do not refactor unrelated code.".to_string());
    out
}

/// Render the document as markdown with fixed sections.
pub fn render_markdown(doc: &FeedbackDocument) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Factory Feedback: Iteration {}", doc.iteration);
    let _ = writeln!(out, "Generated: {}", doc.generated_at);
    out.push('\n');

    out.push_str("## Summary\n");
    for line in &doc.summary {
        if line.starts_with("- ") {
            let _ = writeln!(out, "  {line}");
        } else {
            let _ = writeln!(out, "- {line}");
        }
    }
    out.push('\n');

    out.push_str("## Convergence Trajectory\n");
    let _ = writeln!(out, "Trend: {}", doc.trend.as_str());
    out.push('\n');
    out.push_str("| Iteration | Satisfaction |\n|-----------|--------------|\n");
    for point in &doc.trajectory {
        let _ = writeln!(out, "| {} | {:.1}% |", point.iteration, point.score * 100.0);
    }
    out.push('\n');

    out.push_str("## Likely Root Causes\n");
    if doc.likely_root_causes.is_empty() {
        out.push_str("None inferred.\n");
    }
    for (idx, cause) in doc.likely_root_causes.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. **{}** in {} item(s): {}. {}",
            idx + 1,
            cause.category.label(),
            cause.affected.len(),
            cause.affected.join(", "),
            cause.explanation
        );
    }
    out.push('\n');

    out.push_str("## Failure Details\n");
    if doc.failure_details.is_empty() {
        out.push_str("No failures.\n");
    }
    for detail in &doc.failure_details {
        out.push('\n');
        render_detail(&mut out, detail);
    }
    out.push('\n');

    out.push_str("## Priority Instructions\n");
    for (idx, line) in doc.priority_instructions.iter().enumerate() {
        let _ = writeln!(out, "{}. {line}", idx + 1);
    }
    out
}

fn render_detail(out: &mut String, detail: &FailureDetail) {
    match detail {
        FailureDetail::Scenario {
            name,
            category,
            exit_code,
            duration_seconds,
            timed_out,
            error_summary,
            stdout,
            stderr,
            root_cause,
        } => {
            let _ = writeln!(out, "### Scenario: {name}");
            let _ = writeln!(out, "- Category: {category}");
            let _ = writeln!(out, "- Exit code: {exit_code}");
            let _ = writeln!(out, "- Duration: {duration_seconds:.2}s");
            if *timed_out {
                out.push_str("- Timed out: yes\n");
            }
            let _ = writeln!(
                out,
                "- Error summary: {}",
                error_summary.as_deref().unwrap_or("n/a")
            );
            let _ = writeln!(out, "- Likely cause: {}", root_cause.label());
            push_block(out, "stderr", stderr);
            push_block(out, "stdout", stdout);
        }
        FailureDetail::Gate {
            gate,
            exit_code,
            timed_out,
            log,
            root_cause,
        } => {
            let _ = writeln!(out, "### {}", gate.title());
            match exit_code {
                Some(code) => {
                    let _ = writeln!(out, "- Exit code: {code}");
                }
                None => out.push_str("- Exit code: none\n"),
            }
            if *timed_out {
                out.push_str("- Timed out: yes\n");
            }
            let _ = writeln!(out, "- Likely cause: {}", root_cause.label());
            push_block(out, "log", log);
        }
        FailureDetail::Rejected { gate, error } => {
            let _ = writeln!(out, "### {}", gate.title());
            let _ = writeln!(out, "- Scenario set rejected: {error}");
        }
        FailureDetail::Finding { gate, finding } => {
            let location = finding
                .location()
                .map(|l| format!(" at {l}"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "### {} finding [{}] {}{}",
                gate,
                finding.severity,
                finding.check,
                location
            );
            let _ = writeln!(out, "{}", finding.message);
        }
    }
}

fn push_block(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let fence = fence_for(text);
    let _ = writeln!(out, "**{label}:**");
    let _ = writeln!(out, "{fence}");
    out.push_str(text);
    if !text.ends_with('\n') {
        out.push('\n');
    }
    let _ = writeln!(out, "{fence}");
}

/// A backtick fence longer than any run inside `text`, so content is never cut.
fn fence_for(text: &str) -> String {
    let mut longest = 0usize;
    let mut current = 0usize;
    for ch in text.chars() {
        if ch == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nfr::NfrCheckReport;
    use crate::core::root_cause::default_rules;
    use crate::core::scenario::{Scenario, summarize};
    use crate::core::types::DeterministicOutcome;
    use std::collections::BTreeMap;

    fn scenario(name: &str) -> Scenario {
        Scenario {
            name: name.to_string(),
            category: ScenarioCategory::Cli,
            preconditions: "SECRET_PRECONDITION".to_string(),
            behavioral_expectation: "SECRET_EXPECTATION".to_string(),
            evaluation_command: "SECRET_COMMAND --flag".to_string(),
            pass_criteria: "SECRET_CRITERIA".to_string(),
            evidence_required: Vec::new(),
            side_effect_free: false,
            source: format!("scenarios/{name}.md"),
        }
    }

    fn input<'a>(
        summary: Option<&'a ScenarioRunSummary>,
        nfr: Option<&'a NfrReport>,
        gates: &'a [GateResult],
    ) -> FeedbackInput<'a> {
        FeedbackInput {
            iteration: 2,
            generated_at: "2026-01-01T00:00:00Z",
            summary,
            nfr,
            gate_results: gates,
            history: &[],
            verdict: None,
            trend_window: 3,
        }
    }

    #[test]
    fn reproduces_failure_output_verbatim_without_holdout_content() {
        let s = scenario("imports");
        let stdout = "line one\n```\nModuleNotFoundError: No module named 'env'\n".to_string();
        let summary = summarize(
            vec![
                ScenarioResult::completed(&s, 1, 0.5, stdout.clone(), "stderr text".to_string()),
                ScenarioResult::completed(&scenario("ok"), 0, 0.1, "fine".to_string(), String::new()),
            ],
            "t",
        );
        let gates = vec![GateResult::new(
            GateId::Gate3,
            GateStatus::Fail,
            GateFindings::Scenarios {
                summary: summary.clone(),
            },
        )];
        let doc = compile(default_rules(), &input(Some(&summary), None, &gates));
        let markdown = render_markdown(&doc);

        assert!(markdown.contains(&stdout));
        assert!(markdown.contains("stderr text"));
        assert!(!markdown.contains("SECRET"));
        assert!(!markdown.contains("fine"));
        assert_eq!(doc.likely_root_causes[0].category, RootCauseCategory::MissingDependency);
        assert!(markdown.contains("````\nline one"));
    }

    #[test]
    fn details_follow_priority_policy() {
        let assertion = scenario("assert");
        let missing = scenario("missing");
        let summary = summarize(
            vec![
                ScenarioResult::completed(&assertion, 1, 0.0, "AssertionError: 1 != 2".to_string(), String::new()),
                ScenarioResult::completed(&missing, 1, 0.0, String::new(), "cat: out.txt: No such file or directory".to_string()),
            ],
            "t",
        );
        let doc = compile(default_rules(), &input(Some(&summary), None, &[]));
        let names: Vec<&str> = doc
            .failure_details
            .iter()
            .filter_map(|d| match d {
                FailureDetail::Scenario { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["missing", "assert"]);
    }

    #[test]
    fn includes_every_non_info_nfr_finding_and_gate_log() {
        let mut checks = BTreeMap::new();
        checks.insert(
            "lint".to_string(),
            NfrCheckReport::from_findings(
                "lint",
                vec![
                    Finding::new("lint", Severity::Nit, "rename x"),
                    Finding::new("lint", Severity::Info, "fyi only"),
                ],
            ),
        );
        let nfr = NfrReport::from_checks(checks);
        let gates = vec![GateResult::new(
            GateId::Gate1,
            GateStatus::Fail,
            GateFindings::Deterministic {
                outcome: DeterministicOutcome {
                    exit_code: Some(101),
                    timed_out: false,
                    log: "test foo ... FAILED\npanicked at src/lib.rs:9".to_string(),
                },
            },
        )];
        let doc = compile(default_rules(), &input(None, Some(&nfr), &gates));
        let markdown = render_markdown(&doc);
        assert!(markdown.contains("rename x"));
        assert!(!markdown.contains("fyi only"));
        assert!(markdown.contains("panicked at src/lib.rs:9"));
        assert!(markdown.contains("No scenario results"));
        assert!(doc.priority_instructions[0].contains("deterministic checks"));
    }

    #[test]
    fn trajectory_appends_current_iteration() {
        let history = vec![IterationRecord {
            iteration: 1,
            timestamp: "t".to_string(),
            gate_results: Vec::new(),
            satisfaction_score: Some(0.25),
            decision: Decision::Loop,
            failure_signatures: Vec::new(),
            restore_ref: None,
            merge_commit: None,
            agent_exit_code: None,
        }];
        let summary = summarize(
            vec![ScenarioResult::completed(&scenario("a"), 0, 0.0, String::new(), String::new())],
            "t",
        );
        let doc = compile(
            default_rules(),
            &FeedbackInput {
                history: &history,
                ..input(Some(&summary), None, &[])
            },
        );
        assert_eq!(
            doc.trajectory,
            vec![
                TrajectoryPoint { iteration: 1, score: 0.25 },
                TrajectoryPoint { iteration: 2, score: 1.0 },
            ]
        );
        assert_eq!(doc.trend, Trend::Improving);
    }
}
