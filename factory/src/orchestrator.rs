//! Orchestration for a single convergence iteration.
//!
//! ```text
//! STRIP_HOLDOUT -> AWAIT_AGENT -> GATE0_REVIEW -> MERGE -> RESTORE_HOLDOUT
//!   -> GATE1 -> GATE2 -> GATE3 -> JUDGE -> CONVERGED | LOOP | ESCALATE
//! ```
//!
//! Every transition is checkpointed. Isolation failures abort the iteration;
//! gate failures never do. Gate-0 and Gate-1 failures skip the remaining gates
//! but the agent's change is always merged and the holdout always restored
//! before judging.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::feedback::{FeedbackInput, compile, render_markdown};
use crate::core::judge::{Decision, JudgeInput, Verdict, judge, scenario_gate_status};
use crate::core::nfr::NfrReport;
use crate::core::record::IterationRecord;
use crate::core::root_cause::default_rules;
use crate::core::scenario::{ScenarioRunSummary, summarize};
use crate::core::state::{IterationState, StateMachine};
use crate::core::trajectory::{detect_stall, failure_signatures, scores, trend};
use crate::core::types::{GateFindings, GateId, GateResult, GateStatus, Severity};
use crate::error::{IsolationError, ScenarioConservationError, ScenarioFormatError};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::checkpoint::{Checkpoint, clear_checkpoint, load_checkpoint, write_checkpoint};
use crate::io::clock::now_rfc3339;
use crate::io::config::{FactoryConfig, load_config};
use crate::io::gate1::{DeterministicGate, Gate1Request};
use crate::io::git::Git;
use crate::io::holdout::{HoldoutIsolator, IsolationOptions};
use crate::io::iteration_log::{
    IterationPaths, IterationWriteRequest, append_record, load_records, write_iteration,
    write_text,
};
use crate::io::iteration_store::IterationStore;
use crate::io::nfr::NfrRegistry;
use crate::io::paths::{FACTORY_DIR, FactoryPaths};
use crate::io::review::{ReviewRequest, Reviewer};
use crate::io::scenario_runner::ScenarioRunner;
use crate::io::scenarios::discover;
use crate::recover::{merge_agent_work, roll_forward};

/// External collaborators driven by one iteration.
pub struct Collaborators<'a, A: Agent, G: DeterministicGate> {
    pub agent: &'a A,
    /// `None` skips Gate-0.
    pub reviewer: Option<&'a dyn Reviewer>,
    pub gate1: &'a G,
    pub nfr: &'a NfrRegistry,
}

/// Result of one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationOutcome {
    pub iteration: u64,
    pub verdict: Verdict,
    pub gate_results: Vec<GateResult>,
    /// `None` when Gate-3 did not produce scores.
    pub satisfaction_score: Option<f64>,
    pub states: Vec<IterationState>,
    pub feedback_path: PathBuf,
}

impl IterationOutcome {
    pub fn decision(&self) -> Decision {
        self.verdict.decision
    }
}

/// State machine plus its durable checkpoint.
struct Progress<'a> {
    path: &'a Path,
    machine: StateMachine,
    checkpoint: Checkpoint,
}

impl<'a> Progress<'a> {
    fn start(path: &'a Path, iteration: u64, restore_ref: String) -> Result<Self> {
        let progress = Self {
            path,
            machine: StateMachine::default(),
            checkpoint: Checkpoint {
                iteration,
                state: IterationState::INITIAL,
                restore_ref,
                strip_commit: None,
                updated_at: now_rfc3339(),
            },
        };
        write_checkpoint(path, &progress.checkpoint)?;
        Ok(progress)
    }

    fn advance(&mut self, next: IterationState) -> Result<()> {
        self.machine
            .advance(next)
            .map_err(|err| anyhow!("iteration {}: {err}", self.checkpoint.iteration))?;
        self.checkpoint.state = next;
        self.checkpoint.updated_at = now_rfc3339();
        info!(iteration = self.checkpoint.iteration, state = %next, "iteration state");
        if !next.is_terminal() {
            write_checkpoint(self.path, &self.checkpoint)?;
        }
        Ok(())
    }

    fn state(&self) -> IterationState {
        self.machine.current()
    }
}

/// Run one full iteration in `root`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_iteration<A: Agent, G: DeterministicGate>(
    root: &Path,
    collab: &Collaborators<'_, A, G>,
) -> Result<IterationOutcome> {
    let paths = FactoryPaths::new(root);
    let cfg = load_config(&paths.config)?;
    if let Some(pending) = load_checkpoint(&paths.checkpoint)? {
        return Err(anyhow!(
            "iteration {} was interrupted in {}; run `factory recover` first",
            pending.iteration,
            pending.state
        ));
    }
    let git = Git::new(root);
    git.ensure_clean_except_prefixes(&[&format!("{FACTORY_DIR}/")])?;

    let restore_ref = match &cfg.holdout.restore_ref {
        Some(reference) => git.rev_parse(reference)?,
        None => git.head_sha()?,
    };
    if git.ls_tree_files(&restore_ref, cfg.holdout.dir.trim_end_matches('/'))?.is_empty() {
        return Err(IsolationError::NothingToRestore {
            reference: restore_ref,
            dir: cfg.holdout.dir.clone(),
        }
        .into());
    }

    let history = load_records(&paths.iteration_log)?;
    let mut store = IterationStore::load(&paths.iteration_counter)?;
    let iteration = store.increment()?;
    let iter_paths = IterationPaths::new(&paths.iterations_dir, iteration);
    fs::create_dir_all(&iter_paths.dir)
        .with_context(|| format!("create iteration dir {}", iter_paths.dir.display()))?;
    info!(iteration, restore_ref = %restore_ref, "starting iteration");

    let mut progress = Progress::start(&paths.checkpoint, iteration, restore_ref)?;
    let run = IterationRun {
        paths: &paths,
        iter_paths: &iter_paths,
        cfg: &cfg,
        git: &git,
        history: &history,
        iteration,
    };
    match run.execute(collab, &mut progress) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            error!(iteration, state = %progress.state(), err = %err, "iteration aborted");
            write_text(&iter_paths.error_log_path, &format!("factory error: {err:#}\n"))?;
            let state = progress.state();
            let touches_holdout = state.holdout_stripped()
                || matches!(state, IterationState::StripHoldout | IterationState::RestoreHoldout);
            if touches_holdout {
                // Never leave the tree stripped.
                if let Err(recover_err) = roll_forward(&paths, &cfg, &progress.checkpoint) {
                    warn!(err = %recover_err, "roll forward failed; run `factory recover`");
                }
            } else {
                clear_checkpoint(&paths.checkpoint)?;
            }
            Err(err)
        }
    }
}

struct IterationRun<'a> {
    paths: &'a FactoryPaths,
    iter_paths: &'a IterationPaths,
    cfg: &'a FactoryConfig,
    git: &'a Git,
    history: &'a [IterationRecord],
    iteration: u64,
}

impl IterationRun<'_> {
    fn execute<A: Agent, G: DeterministicGate>(
        &self,
        collab: &Collaborators<'_, A, G>,
        progress: &mut Progress<'_>,
    ) -> Result<IterationOutcome> {
        let cfg = self.cfg;
        let isolator = HoldoutIsolator::new(&self.paths.root, &cfg.holdout);

        let strip = isolator.strip(IsolationOptions::default())?;
        progress.checkpoint.strip_commit = strip.commit;
        progress.advance(IterationState::AwaitAgent)?;

        let agent_exit_code = self.run_agent(collab.agent);
        progress.advance(IterationState::Gate0Review)?;

        let gate0 = self.run_gate0(collab.reviewer)?;
        progress.advance(IterationState::Merge)?;

        let merge_commit = merge_agent_work(self.git, self.iteration, false)?;
        progress.advance(IterationState::RestoreHoldout)?;

        isolator.restore(&progress.checkpoint.restore_ref, IsolationOptions::default())?;

        let mut gate_results = vec![gate0];
        let mut nfr_report: Option<NfrReport> = None;
        let mut scenario_summary: Option<ScenarioRunSummary> = None;

        if gate_results[0].blocks() {
            progress.advance(IterationState::Judge)?;
            for gate in [GateId::Gate1, GateId::Gate2, GateId::Gate3] {
                gate_results.push(GateResult::skipped(gate, "Gate-0 review failed"));
            }
        } else {
            progress.advance(IterationState::Gate1)?;
            let gate1 = self.run_gate1(collab.gate1)?;
            let gate1_failed = gate1.blocks();
            gate_results.push(gate1);
            if gate1_failed {
                progress.advance(IterationState::Judge)?;
                for gate in [GateId::Gate2, GateId::Gate3] {
                    gate_results.push(GateResult::skipped(gate, "Gate-1 deterministic checks failed"));
                }
            } else {
                progress.advance(IterationState::Gate2)?;
                let report = collab.nfr.run_all(&self.paths.root);
                let status = if report.has_failures() {
                    GateStatus::Fail
                } else {
                    GateStatus::Pass
                };
                gate_results.push(GateResult::new(
                    GateId::Gate2,
                    status,
                    GateFindings::NonFunctional {
                        report: report.clone(),
                    },
                ));
                nfr_report = Some(report);

                progress.advance(IterationState::Gate3)?;
                match self.run_gate3()? {
                    Ok(summary) => {
                        let status = scenario_gate_status(&cfg.judge_policy(), &summary);
                        gate_results.push(GateResult::new(
                            GateId::Gate3,
                            status,
                            GateFindings::Scenarios {
                                summary: summary.clone(),
                            },
                        ));
                        scenario_summary = Some(summary);
                    }
                    Err(error) => gate_results.push(GateResult::new(
                        GateId::Gate3,
                        GateStatus::Fail,
                        GateFindings::ScenarioSetRejected { error },
                    )),
                }
                progress.advance(IterationState::Judge)?;
            }
        }

        let satisfaction_score = scenario_summary.as_ref().map(|s| s.satisfaction_score);
        let signatures = failure_signatures(&gate_results);
        let timestamp = now_rfc3339();
        let mut record = IterationRecord {
            iteration: self.iteration,
            timestamp: timestamp.clone(),
            gate_results: gate_results.clone(),
            satisfaction_score,
            decision: Decision::Loop,
            failure_signatures: signatures,
            restore_ref: Some(progress.checkpoint.restore_ref.clone()),
            merge_commit,
            agent_exit_code,
        };

        let mut with_current = self.history.to_vec();
        with_current.push(record.clone());
        let window = cfg.judge.stall_window;
        let stall = detect_stall(&with_current, window);
        let verdict = judge(
            &cfg.judge_policy(),
            &JudgeInput {
                iteration: self.iteration,
                gate_results: &gate_results,
                trend: trend(&scores(&with_current), window),
                stall: stall.as_ref(),
            },
        );
        record.decision = verdict.decision;
        progress.advance(match verdict.decision {
            Decision::Converged => IterationState::Converged,
            Decision::Loop => IterationState::Loop,
            Decision::Escalate => IterationState::Escalate,
        })?;

        let feedback = compile(
            default_rules(),
            &FeedbackInput {
                iteration: self.iteration,
                generated_at: &timestamp,
                summary: scenario_summary.as_ref(),
                nfr: nfr_report.as_ref(),
                gate_results: &gate_results,
                history: self.history,
                verdict: Some(&verdict),
                trend_window: window,
            },
        );
        let markdown = render_markdown(&feedback);
        write_iteration(&IterationWriteRequest {
            paths: self.iter_paths,
            gate_results: &gate_results,
            scenarios: scenario_summary.as_ref(),
            nfr: nfr_report.as_ref(),
            verdict: &verdict,
            feedback: &feedback,
            feedback_markdown: &markdown,
        })?;
        write_text(&self.paths.feedback_for(self.iteration), &markdown)?;
        write_text(&self.paths.latest_feedback, &markdown)?;

        append_record(&self.paths.iteration_log, &record)?;
        clear_checkpoint(&self.paths.checkpoint)?;
        info!(
            iteration = self.iteration,
            decision = verdict.decision.as_str(),
            ?satisfaction_score,
            "iteration finished"
        );

        Ok(IterationOutcome {
            iteration: self.iteration,
            verdict,
            gate_results,
            satisfaction_score,
            states: progress.machine.path().to_vec(),
            feedback_path: self.paths.latest_feedback.clone(),
        })
    }

    /// Agent failures are recorded, never fatal.
    fn run_agent<A: Agent>(&self, agent: &A) -> Option<i32> {
        let feedback = fs::read_to_string(&self.paths.latest_feedback).unwrap_or_default();
        let request = AgentRequest {
            workdir: self.paths.root.clone(),
            iteration: self.iteration,
            feedback,
            log_path: self.iter_paths.agent_log_path.clone(),
            stream_path: Some(self.iter_paths.agent_stream_path.clone()),
            timeout: Duration::from_secs(self.cfg.agent.timeout_secs),
            output_limit_bytes: self.cfg.agent.output_limit_bytes,
        };
        match agent.run(&request) {
            Ok(run) => run.exit_code,
            Err(err) => {
                warn!(err = %err, "agent invocation failed");
                if let Err(log_err) =
                    write_text(&request.log_path, &format!("agent invocation failed: {err:#}\n"))
                {
                    warn!(err = %log_err, "could not write agent log");
                }
                None
            }
        }
    }

    fn run_gate0(&self, reviewer: Option<&dyn Reviewer>) -> Result<GateResult> {
        let Some(reviewer) = reviewer else {
            return Ok(GateResult::skipped(GateId::Gate0, "no reviewer configured"));
        };
        let findings = reviewer.review(&ReviewRequest {
            workdir: self.paths.root.clone(),
            iteration: self.iteration,
            log_path: self.iter_paths.review_log_path.clone(),
            timeout: Duration::from_secs(self.cfg.review.timeout_secs),
            output_limit_bytes: self.cfg.agent.output_limit_bytes,
        })?;
        let status = if findings.iter().any(|f| f.severity == Severity::Critical) {
            GateStatus::Fail
        } else {
            GateStatus::Pass
        };
        Ok(GateResult::new(
            GateId::Gate0,
            status,
            GateFindings::Review { findings },
        ))
    }

    fn run_gate1<G: DeterministicGate>(&self, gate1: &G) -> Result<GateResult> {
        let outcome = gate1.run(&Gate1Request {
            workdir: self.paths.root.clone(),
            log_path: self.iter_paths.gate1_log_path.clone(),
            timeout: Duration::from_secs(self.cfg.gate1.timeout_secs),
            output_limit_bytes: self.cfg.gate1.output_limit_bytes,
        })?;
        let status = if outcome.passed() {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        };
        Ok(GateResult::new(
            GateId::Gate1,
            status,
            GateFindings::Deterministic { outcome },
        ))
    }

    /// Discover and run the full scenario set; the summary must account for every scenario.
    ///
    /// The inner `Err` is a rejected scenario set (malformed document or lost
    /// results). It fails Gate-3 without aborting the iteration.
    fn run_gate3(&self) -> Result<Result<ScenarioRunSummary, String>> {
        let scenarios = match discover(&self.paths.root, &self.cfg.holdout.dir) {
            Ok(scenarios) => scenarios,
            Err(err) => {
                let Some(rejected) = err.downcast_ref::<ScenarioFormatError>() else {
                    return Err(err);
                };
                warn!(error = %rejected, "scenario set rejected");
                return Ok(Err(rejected.to_string()));
            }
        };
        let results = ScenarioRunner::new(&self.paths.root, &self.cfg.scenarios).run(&scenarios);
        let summary = summarize(results, &now_rfc3339());
        if summary.total != scenarios.len() {
            let lost = ScenarioConservationError {
                discovered: scenarios.len(),
                summarized: summary.total,
            };
            error!(error = %lost, "scenario results do not cover the discovered set");
            return Ok(Err(lost.to_string()));
        }
        Ok(Ok(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Finding;
    use crate::io::holdout::{RESTORE_MARKER, STRIP_MARKER};
    use crate::test_support::{
        ScriptedAgent, ScriptedAgentStep, ScriptedGate1, ScriptedReviewer, TestRepo,
    };

    fn setup(scenarios: &[(&str, &str)]) -> (TestRepo, FactoryPaths) {
        let repo = TestRepo::new().expect("repo");
        let cfg = FactoryConfig {
            scenarios: crate::io::config::ScenariosConfig {
                shell: vec!["sh".to_string(), "-c".to_string()],
                timeout_secs: 5,
                ..Default::default()
            },
            ..FactoryConfig::default()
        };
        let paths = repo.init_factory(&cfg).expect("init");
        repo.add_scenarios(scenarios).expect("scenarios");
        (repo, paths)
    }

    #[test]
    fn passing_iteration_converges_and_restores() {
        let (repo, paths) = setup(&[("ready", "test -f done.txt")]);
        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::writes(&[("done.txt", "ok")])]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        let outcome = run_iteration(repo.path(), &collab).expect("iteration");
        assert_eq!(outcome.decision(), Decision::Converged);
        assert_eq!(outcome.satisfaction_score, Some(1.0));
        assert_eq!(outcome.states.last(), Some(&IterationState::Converged));

        let calls = agent.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].holdout_present);
        assert!(repo.exists("scenarios/ready.md"));
        assert!(!paths.checkpoint.exists());
        assert!(paths.latest_feedback.exists());

        let subjects = repo.log_subjects().expect("log");
        assert!(subjects[0].starts_with(RESTORE_MARKER));
        assert!(subjects[1].starts_with("[factory:merge] iteration 1"));
        assert!(subjects[2].starts_with(STRIP_MARKER));
    }

    /// A CRITICAL review finding skips Gates 1-3 but the change is still merged.
    #[test]
    fn critical_review_finding_fails_fast_and_keeps_change() {
        let (repo, _paths) = setup(&[("ready", "true")]);
        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::writes(&[(
            "src/lib.rs",
            "pub const KEY: &str = \"secret\";\n",
        )])]);
        let reviewer = ScriptedReviewer::new(vec![vec![Finding::new(
            "review",
            Severity::Critical,
            "hardcoded credential",
        )]]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: Some(&reviewer),
            gate1: &gate1,
            nfr: &nfr,
        };

        let outcome = run_iteration(repo.path(), &collab).expect("iteration");
        assert_eq!(outcome.decision(), Decision::Loop);
        for gate in [GateId::Gate1, GateId::Gate2, GateId::Gate3] {
            let result = outcome
                .gate_results
                .iter()
                .find(|r| r.gate == gate)
                .expect("gate result");
            assert_eq!(result.status, GateStatus::Skipped);
        }
        assert!(repo.exists("src/lib.rs"));
        assert!(repo.exists("scenarios/ready.md"));
        assert!(repo.status().expect("status").is_empty());
    }

    #[test]
    fn gate1_failure_skips_later_gates_and_writes_feedback() {
        let (repo, paths) = setup(&[("ready", "true")]);
        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::default()]);
        let gate1 = ScriptedGate1::new(vec![(1, "error[E0425]: cannot find value `x`\n")]);
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        let outcome = run_iteration(repo.path(), &collab).expect("iteration");
        assert_eq!(outcome.decision(), Decision::Loop);
        let statuses: Vec<GateStatus> = outcome.gate_results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                GateStatus::Skipped,
                GateStatus::Fail,
                GateStatus::Skipped,
                GateStatus::Skipped
            ]
        );
        let feedback = fs::read_to_string(&paths.latest_feedback).expect("feedback");
        assert!(feedback.contains("cannot find value `x`"));
        assert!(paths.feedback_for(1).exists());
        let records = load_records(&paths.iteration_log).expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(outcome.satisfaction_score, None);
        assert_eq!(records[0].satisfaction_score, None);
    }

    /// A malformed holdout document fails Gate-3 but still leaves feedback and a record.
    #[test]
    fn malformed_scenario_fails_gate3_with_feedback() {
        let (repo, paths) = setup(&[("ready", "true")]);
        repo.write("scenarios/bad.md", "# Scenario: bad\n\n## Category\ncli\n")
            .expect("bad scenario");
        repo.commit_all("test: malformed scenario").expect("commit");
        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::default()]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        let outcome = run_iteration(repo.path(), &collab).expect("iteration");
        assert_eq!(outcome.decision(), Decision::Escalate);
        assert_eq!(outcome.satisfaction_score, None);
        let gate3 = outcome
            .gate_results
            .iter()
            .find(|r| r.gate == GateId::Gate3)
            .expect("gate3");
        assert_eq!(gate3.status, GateStatus::Fail);
        let error = gate3.rejection().expect("rejection");
        assert!(error.contains("scenarios/bad.md"));
        assert!(error.contains("missing required section"));

        let feedback = fs::read_to_string(&paths.latest_feedback).expect("feedback");
        assert!(feedback.contains("Scenario set rejected"));
        assert!(!feedback.contains("The command exits 0."));
        let records = load_records(&paths.iteration_log).expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, Decision::Escalate);
        assert!(!paths.checkpoint.exists());
        assert!(repo.exists("scenarios/bad.md"));
        assert!(repo.exists("scenarios/ready.md"));
    }

    #[test]
    fn feedback_reaches_the_next_agent_call_without_holdout_content() {
        let (repo, _paths) = setup(&[("needs-file", "cat missing.txt")]);
        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::default(), ScriptedAgentStep::default()]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        run_iteration(repo.path(), &collab).expect("iteration 1");
        run_iteration(repo.path(), &collab).expect("iteration 2");
        let calls = agent.calls();
        assert_eq!(calls[0].feedback, "");
        assert!(calls[1].feedback.contains("# Factory Feedback: Iteration 1"));
        assert!(calls[1].feedback.contains("needs-file"));
        assert!(!calls[1].feedback.contains("cat missing.txt"));
        assert!(calls.iter().all(|c| !c.holdout_present));
    }

    #[test]
    fn refuses_to_run_over_a_pending_checkpoint() {
        let (repo, paths) = setup(&[("ready", "true")]);
        write_checkpoint(
            &paths.checkpoint,
            &Checkpoint {
                iteration: 1,
                state: IterationState::AwaitAgent,
                restore_ref: repo.head().expect("head"),
                strip_commit: None,
                updated_at: now_rfc3339(),
            },
        )
        .expect("checkpoint");
        let agent = ScriptedAgent::new(Vec::new());
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };
        let err = run_iteration(repo.path(), &collab).expect_err("pending");
        assert!(err.to_string().contains("factory recover"));
        assert!(agent.calls().is_empty());
    }
}
