//! Convergence validation engine for agent-written code.
//!
//! Hides the holdout scenarios from the coding agent, grades each iteration
//! through four gates and decides whether to converge, loop or escalate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use factory::core::judge::Decision;
use factory::core::scenario::{ScenarioCategory, summarize};
use factory::exit_codes;
use factory::io::agent::CommandAgent;
use factory::io::checkpoint::load_checkpoint;
use factory::io::clock::now_rfc3339;
use factory::io::config::load_config;
use factory::io::gate1::CommandGate1;
use factory::io::holdout::{HoldoutIsolator, IsolationOptions};
use factory::io::init::{InitOptions, init_factory};
use factory::io::iteration_log::{load_records, write_json};
use factory::io::iteration_store::IterationStore;
use factory::io::nfr::NfrRegistry;
use factory::io::paths::FactoryPaths;
use factory::io::review::{CommandReviewer, Reviewer};
use factory::io::scenario_runner::ScenarioRunner;
use factory::io::scenarios::discover;
use factory::logging;
use factory::looping::{LoopStop, run_loop};
use factory::orchestrator::{Collaborators, IterationOutcome, run_iteration};
use factory::recover::recover;

#[derive(Parser)]
#[command(
    name = "factory",
    version,
    about = "Convergence validation for agent-written code"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.factory/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Remove the holdout scenarios and disable their build targets.
    Strip {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_commit: bool,
    },
    /// Bring the holdout back from a git reference.
    Restore {
        /// Defaults to the configured ref, else the commit before the last strip.
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_commit: bool,
    },
    /// Run holdout scenarios and report the satisfaction score.
    RunScenarios {
        /// Per-scenario timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        category: Option<String>,
        /// Write the run summary as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run non-functional checks.
    Nfr {
        #[arg(long)]
        check: Option<String>,
        /// Write the report as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run one full iteration.
    Iterate,
    /// Run iterations until converged or escalated.
    Loop,
    /// Roll an interrupted iteration forward.
    Recover,
    /// Show the iteration counter, trajectory and last decision.
    Status,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Strip { dry_run, no_commit } => cmd_strip(&root, IsolationOptions { dry_run, no_commit }),
        Command::Restore {
            reference,
            dry_run,
            no_commit,
        } => cmd_restore(&root, reference, IsolationOptions { dry_run, no_commit }),
        Command::RunScenarios {
            timeout,
            category,
            output,
        } => cmd_run_scenarios(&root, timeout, category, output),
        Command::Nfr { check, output } => cmd_nfr(&root, check, output),
        Command::Iterate => cmd_iterate(&root),
        Command::Loop => cmd_loop(&root),
        Command::Recover => cmd_recover(&root),
        Command::Status => cmd_status(&root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_factory(root, &InitOptions { force })?;
    println!("initialized {}", paths.factory_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_strip(root: &Path, opts: IsolationOptions) -> Result<i32> {
    let cfg = load_config(&FactoryPaths::new(root).config)?;
    let receipt = HoldoutIsolator::new(root, &cfg.holdout).strip(opts)?;
    print_json(&receipt)?;
    Ok(exit_codes::OK)
}

fn cmd_restore(root: &Path, reference: Option<String>, opts: IsolationOptions) -> Result<i32> {
    let paths = FactoryPaths::new(root);
    let cfg = load_config(&paths.config)?;
    let isolator = HoldoutIsolator::new(root, &cfg.holdout);
    let reference = match reference {
        Some(reference) => reference,
        None => match load_checkpoint(&paths.checkpoint)? {
            Some(checkpoint) => checkpoint.restore_ref,
            None => isolator.default_restore_ref()?,
        },
    };
    let receipt = isolator.restore(&reference, opts)?;
    print_json(&receipt)?;
    Ok(exit_codes::OK)
}

fn cmd_run_scenarios(
    root: &Path,
    timeout: Option<u64>,
    category: Option<String>,
    output: Option<PathBuf>,
) -> Result<i32> {
    let cfg = load_config(&FactoryPaths::new(root).config)?;
    let mut scenarios = discover(root, &cfg.holdout.dir)?;
    if let Some(category) = &category {
        let wanted = ScenarioCategory::parse(category);
        scenarios.retain(|s| s.category == wanted);
    }
    let mut runner = ScenarioRunner::new(root, &cfg.scenarios);
    if let Some(secs) = timeout {
        runner = runner.with_timeout(Duration::from_secs(secs));
    }
    let summary = summarize(runner.run(&scenarios), &now_rfc3339());

    for result in &summary.results {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        println!(
            "{mark} {} ({:.2}s){}",
            result.scenario_name,
            result.duration_seconds,
            result
                .error_summary
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }
    println!(
        "satisfaction: {:.1}% ({}/{} passed)",
        summary.satisfaction_score * 100.0,
        summary.passed,
        summary.total
    );
    if let Some(path) = &output {
        write_json(path, &summary)?;
    }
    if summary.total > 0 && summary.failed == 0 {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::FAILURE)
    }
}

fn cmd_nfr(root: &Path, check: Option<String>, output: Option<PathBuf>) -> Result<i32> {
    let cfg = load_config(&FactoryPaths::new(root).config)?;
    let registry = NfrRegistry::from_config(&cfg.nfr)?;
    let report = match check {
        Some(name) => registry.run_one(root, &name)?,
        None => registry.run_all(root),
    };
    for (name, check) in &report.checks {
        println!("{name}: {} ({})", check.status.as_str(), check.summary);
    }
    println!(
        "findings: {} critical, {} warning, {} nit, {} info",
        report.counts.critical, report.counts.warning, report.counts.nit, report.counts.info
    );
    if let Some(path) = &output {
        write_json(path, &report)?;
    }
    if report.has_failures() {
        Ok(exit_codes::FAILURE)
    } else {
        Ok(exit_codes::OK)
    }
}

/// Command-backed collaborators built from config.
struct CommandCollaborators {
    agent: CommandAgent,
    reviewer: Option<CommandReviewer>,
    gate1: CommandGate1,
    nfr: NfrRegistry,
}

impl CommandCollaborators {
    fn load(root: &Path) -> Result<Self> {
        let cfg = load_config(&FactoryPaths::new(root).config)?;
        Ok(Self {
            agent: CommandAgent::new(cfg.agent.command.clone()),
            reviewer: (!cfg.review.command.is_empty())
                .then(|| CommandReviewer::new(cfg.review.command.clone())),
            gate1: CommandGate1::new(cfg.gate1.command.clone()),
            nfr: NfrRegistry::from_config(&cfg.nfr)?,
        })
    }

    fn borrow(&self) -> Collaborators<'_, CommandAgent, CommandGate1> {
        Collaborators {
            agent: &self.agent,
            reviewer: self.reviewer.as_ref().map(|r| r as &dyn Reviewer),
            gate1: &self.gate1,
            nfr: &self.nfr,
        }
    }
}

fn cmd_iterate(root: &Path) -> Result<i32> {
    let collab = CommandCollaborators::load(root)?;
    let outcome = run_iteration(root, &collab.borrow())?;
    print_outcome(&outcome);
    Ok(decision_code(outcome.decision()))
}

fn cmd_loop(root: &Path) -> Result<i32> {
    let collab = CommandCollaborators::load(root)?;
    let outcome = run_loop(root, &collab.borrow(), print_outcome)?;
    match outcome.stop {
        LoopStop::Converged { iteration } => {
            println!("converged at iteration {iteration}");
            Ok(exit_codes::OK)
        }
        LoopStop::Escalated { iteration, .. } => {
            println!("escalated at iteration {iteration}; human review required");
            Ok(exit_codes::ESCALATE)
        }
    }
}

fn cmd_recover(root: &Path) -> Result<i32> {
    match recover(root)? {
        Some(outcome) => print_json(&outcome)?,
        None => println!("nothing to recover"),
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = FactoryPaths::new(root);
    let store = IterationStore::load(&paths.iteration_counter)?;
    let records = load_records(&paths.iteration_log)?;
    println!("iteration: {}", store.current());
    if let Some(checkpoint) = load_checkpoint(&paths.checkpoint)? {
        println!(
            "interrupted: iteration {} in {} (run `factory recover`)",
            checkpoint.iteration, checkpoint.state
        );
    }
    for record in &records {
        let passed = record
            .scenario_summary()
            .map(|s| format!("{}/{}", s.passed, s.total))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<4} {:>7} {:>7}  {}",
            record.iteration,
            percent(record.satisfaction_score),
            passed,
            record.decision.as_str()
        );
    }
    match records.last() {
        Some(last) => println!("last decision: {}", last.decision.as_str()),
        None => println!("last decision: none"),
    }
    Ok(exit_codes::OK)
}

fn print_outcome(outcome: &IterationOutcome) {
    println!(
        "iteration {}: {} (satisfaction {})",
        outcome.iteration,
        outcome.decision().as_str(),
        percent(outcome.satisfaction_score)
    );
    for reason in &outcome.verdict.reasons {
        println!("  - {reason}");
    }
    println!("feedback: {}", outcome.feedback_path.display());
}

/// `n/a` when scenarios did not run.
fn percent(score: Option<f64>) -> String {
    score.map_or_else(|| "n/a".to_string(), |s| format!("{:.1}%", s * 100.0))
}

fn decision_code(decision: Decision) -> i32 {
    match decision {
        Decision::Converged => exit_codes::OK,
        Decision::Loop => exit_codes::FAILURE,
        Decision::Escalate => exit_codes::ESCALATE,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
