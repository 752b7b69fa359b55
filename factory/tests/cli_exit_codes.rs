//! CLI tests for factory exit codes.
//!
//! Spawns the factory binary and verifies exit codes for success, failed
//! scenarios, invalid configuration, isolation failures and escalation.

use std::fs;
use std::process::{Command, Output};

use factory::exit_codes;
use factory::io::config::{AgentConfig, FactoryConfig, Gate1Config};
use factory::test_support::TestRepo;

fn factory(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_factory"))
        .current_dir(repo.path())
        .args(args)
        .output()
        .expect("run factory")
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Config whose agent and Gate-1 are trivial shell commands.
fn scripted_config(agent: &str) -> FactoryConfig {
    FactoryConfig {
        agent: AgentConfig {
            command: shell(agent),
            ..AgentConfig::default()
        },
        gate1: Gate1Config {
            command: shell("true"),
            ..Gate1Config::default()
        },
        ..FactoryConfig::default()
    }
}

#[test]
fn run_scenarios_exit_code_follows_results() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig::default()).expect("factory");
    repo.add_scenarios(&[("passes", "true")]).expect("scenarios");

    let out = factory(&repo, &["run-scenarios", "--output", "results.json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("satisfaction: 100.0% (1/1 passed)"));
    assert!(repo.exists("results.json"));

    repo.add_scenarios(&[("fails", "echo 'assertion failed' >&2; exit 1")])
        .expect("more scenarios");
    let out = factory(&repo, &["run-scenarios"]);
    assert_eq!(out.status.code(), Some(exit_codes::FAILURE));
}

#[test]
fn invalid_config_exits_with_invalid_code() {
    let repo = TestRepo::new().expect("repo");
    let paths = repo.init_factory(&FactoryConfig::default()).expect("factory");
    fs::write(&paths.config, "max_iterations = 0\n").expect("bad config");

    let out = factory(&repo, &["strip", "--dry-run"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("max_iterations"));
}

#[test]
fn restore_without_holdout_exits_with_isolation_code() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig::default()).expect("factory");

    let out = factory(&repo, &["restore", "--ref", "HEAD"]);
    assert_eq!(out.status.code(), Some(exit_codes::ISOLATION));
}

#[test]
fn strip_then_restore_round_trips_through_cli() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig::default()).expect("factory");
    repo.add_scenarios(&[("smoke", "true")]).expect("scenarios");
    let original = repo.read("scenarios/smoke.md").expect("scenario");

    let out = factory(&repo, &["strip"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(!repo.exists("scenarios"));

    let out = factory(&repo, &["restore"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert_eq!(repo.read("scenarios/smoke.md").expect("scenario"), original);
}

#[test]
fn iterate_exit_code_follows_decision() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&scripted_config("cat > /dev/null; echo ok > built.txt"))
        .expect("factory");
    repo.add_scenarios(&[("built", "test -f built.txt")])
        .expect("scenarios");

    let out = factory(&repo, &["iterate"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("iteration 1: converged"));

    let out = factory(&repo, &["status"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("100.0%     1/1  converged"), "status: {stdout}");
    assert!(stdout.contains("last decision: converged"));
}

#[test]
fn loop_escalation_exits_with_escalate_code() {
    let repo = TestRepo::new().expect("repo");
    repo.init_factory(&FactoryConfig {
        max_iterations: 2,
        ..scripted_config("cat > /dev/null")
    })
    .expect("factory");
    repo.add_scenarios(&[("never", "exit 1")]).expect("scenarios");

    let out = factory(&repo, &["loop"]);
    assert_eq!(out.status.code(), Some(exit_codes::ESCALATE));
    assert!(String::from_utf8_lossy(&out.stdout).contains("escalated at iteration 2"));
    assert!(repo.exists("scenarios/never.md"));
}
