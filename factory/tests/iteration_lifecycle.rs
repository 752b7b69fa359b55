//! Iteration-level harness tests for the full gate lifecycle.
//!
//! These tests drive `run_iteration` and `run_loop` against a real git
//! repository with scripted collaborators to verify holdout isolation,
//! gate ordering, feedback hand-off and loop termination.

use std::fs;

use factory::core::judge::Decision;
use factory::core::state::IterationState;
use factory::core::types::{Finding, GateId, GateStatus, Severity};
use factory::io::config::{FactoryConfig, JudgeConfig};
use factory::io::iteration_log::load_records;
use factory::io::nfr::{NfrRegistry, TestQualityCheck};
use factory::looping::{LoopStop, run_loop};
use factory::orchestrator::{Collaborators, run_iteration};
use factory::test_support::{
    ScriptedAgent, ScriptedAgentStep, ScriptedGate1, ScriptedReviewer, TestRepo,
};

/// Full lifecycle: a red first attempt, then convergence.
///
/// Execution sequence:
/// 1. Iter 1: agent writes nothing useful → Gate-3 fails → LOOP with feedback
/// 2. Iter 2: agent implements the feature → every gate passes → CONVERGED
///
/// Tests: the agent never sees the holdout, feedback from iteration 1 reaches
/// iteration 2, and the trajectory is recorded.
#[test]
fn loop_converges_after_feedback() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.init_factory(&FactoryConfig::default()).expect("factory");
    repo.add_scenarios(&[
        ("greets", "grep -q hello greeting.txt"),
        ("readme", "test -f README.md"),
    ])
    .expect("scenarios");

    let agent = ScriptedAgent::new(vec![
        ScriptedAgentStep::writes(&[("greeting.txt", "bye\n")]),
        ScriptedAgentStep::writes(&[("greeting.txt", "hello\n")]),
    ]);
    let gate1 = ScriptedGate1::default();
    let nfr = NfrRegistry::new();
    let collab = Collaborators {
        agent: &agent,
        reviewer: None,
        gate1: &gate1,
        nfr: &nfr,
    };

    let mut scores = Vec::new();
    let outcome = run_loop(repo.path(), &collab, |o| scores.push(o.satisfaction_score))
        .expect("loop");
    assert_eq!(outcome.stop, LoopStop::Converged { iteration: 2 });
    assert_eq!(scores, vec![Some(0.5), Some(1.0)]);

    let calls = agent.calls();
    assert!(calls.iter().all(|c| !c.holdout_present));
    assert!(calls[1].feedback.contains("### Scenario: greets"));
    assert!(!calls[1].feedback.contains("grep -q hello"));

    let records = load_records(&paths.iteration_log).expect("records");
    let decisions: Vec<Decision> = records.iter().map(|r| r.decision).collect();
    assert_eq!(decisions, vec![Decision::Loop, Decision::Converged]);
    assert!(repo.exists("scenarios/greets.md"));
    assert_eq!(repo.read("greeting.txt").expect("greeting"), "hello\n");
}

/// Gate-0 CRITICAL finding: later gates are skipped, but the change is
/// merged and the holdout restored before the judge runs.
#[test]
fn review_failure_fails_fast_without_losing_work() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.init_factory(&FactoryConfig::default()).expect("factory");
    repo.add_scenarios(&[("ok", "true")]).expect("scenarios");

    let agent = ScriptedAgent::new(vec![ScriptedAgentStep::writes(&[(
        "config.env",
        "PASSWORD=hunter2\n",
    )])]);
    let reviewer = ScriptedReviewer::new(vec![vec![
        Finding::new("review", Severity::Critical, "hardcoded password").at("config.env", Some(1)),
    ]]);
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
    assert_eq!(
        outcome.states,
        vec![
            IterationState::StripHoldout,
            IterationState::AwaitAgent,
            IterationState::Gate0Review,
            IterationState::Merge,
            IterationState::RestoreHoldout,
            IterationState::Judge,
            IterationState::Loop,
        ]
    );
    let gate0 = outcome
        .gate_results
        .iter()
        .find(|r| r.gate == GateId::Gate0)
        .expect("gate0");
    assert_eq!(gate0.status, GateStatus::Fail);
    assert!(repo.exists("config.env"));
    assert!(repo.exists("scenarios/ok.md"));

    let feedback = fs::read_to_string(&paths.latest_feedback).expect("feedback");
    assert!(feedback.contains("hardcoded password"));
    assert!(feedback.contains("Resolve every CRITICAL review finding"));
}

/// Gate-2 findings are reported but never block convergence.
#[test]
fn nfr_findings_do_not_block_convergence() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig::default()).expect("factory");
    repo.add_scenarios(&[("ok", "true")]).expect("scenarios");

    let agent = ScriptedAgent::new(vec![ScriptedAgentStep::writes(&[(
        "tests/smoke.rs",
        "#[test]\nfn smoke() {\n    assert!(true);\n}\n",
    )])]);
    let gate1 = ScriptedGate1::default();
    let mut nfr = NfrRegistry::new();
    nfr.register(TestQualityCheck).expect("register");
    let collab = Collaborators {
        agent: &agent,
        reviewer: None,
        gate1: &gate1,
        nfr: &nfr,
    };

    let outcome = run_iteration(repo.path(), &collab).expect("iteration");
    let gate2 = outcome
        .gate_results
        .iter()
        .find(|r| r.gate == GateId::Gate2)
        .expect("gate2");
    assert_eq!(gate2.status, GateStatus::Fail);
    assert!(!gate2.blocking);
    assert_eq!(outcome.decision(), Decision::Converged);
}

/// A permanently red Gate-1 with the same error escalates instead of looping forever.
#[test]
fn repeated_gate1_failure_escalates() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig {
        judge: JudgeConfig {
            stall_window: 3,
            ..JudgeConfig::default()
        },
        ..FactoryConfig::default()
    })
    .expect("factory");
    repo.add_scenarios(&[("ok", "true")]).expect("scenarios");

    let agent = ScriptedAgent::new(vec![ScriptedAgentStep::default(); 3]);
    let gate1 = ScriptedGate1::new(vec![
        (1, "error: linker `cc` not found\n"),
        (1, "error: linker `cc` not found\n"),
        (1, "error: linker `cc` not found\n"),
    ]);
    let nfr = NfrRegistry::new();
    let collab = Collaborators {
        agent: &agent,
        reviewer: None,
        gate1: &gate1,
        nfr: &nfr,
    };

    let outcome = run_loop(repo.path(), &collab, |_| {}).expect("loop");
    match outcome.stop {
        LoopStop::Escalated { iteration, reasons } => {
            assert_eq!(iteration, 3);
            assert!(reasons.iter().any(|r| r.contains("gate1")));
        }
        other => panic!("expected escalation, got {other:?}"),
    }
}

/// The iteration cap escalates even without a stall.
#[test]
fn max_iterations_escalates() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig {
        max_iterations: 1,
        ..FactoryConfig::default()
    })
    .expect("factory");
    repo.add_scenarios(&[("never", "exit 1")]).expect("scenarios");

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
    assert!(
        outcome
            .verdict
            .reasons
            .iter()
            .any(|r| r.contains("max_iterations"))
    );
}
