//! Test-only fixtures: a throwaway git repository, scenario documents and
//! scripted doubles for the external collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{DeterministicOutcome, Finding};
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::config::{FactoryConfig, write_config};
use crate::io::gate1::{DeterministicGate, Gate1Request};
use crate::io::git::{Git, StatusEntry};
use crate::io::init::{InitOptions, init_factory};
use crate::io::paths::FactoryPaths;
use crate::io::review::{ReviewRequest, Reviewer};

/// Git repository in a temp dir with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git_raw(&["-c", "init.defaultBranch=main", "init", "-q"])?;
        repo.git_raw(&["config", "user.email", "factory@example.com"])?;
        repo.git_raw(&["config", "user.name", "Factory Tests"])?;
        repo.git_raw(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# fixture\n")?;
        repo.commit_all("chore: initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    /// Stage everything and commit; returns HEAD either way.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let git = self.git();
        git.add_all()?;
        git.commit_staged(message)?;
        git.head_sha()
    }

    pub fn head(&self) -> Result<String> {
        self.git().head_sha()
    }

    pub fn head_subject(&self) -> Result<String> {
        self.git().head_subject()
    }

    /// Subjects of every commit, newest first.
    pub fn log_subjects(&self) -> Result<Vec<String>> {
        let out = self.git_raw(&["log", "--format=%s"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        self.git().status_porcelain()
    }

    /// Scaffold `.factory/` with `cfg` and commit it.
    pub fn init_factory(&self, cfg: &FactoryConfig) -> Result<FactoryPaths> {
        let paths = init_factory(self.path(), &InitOptions { force: true })?;
        write_config(&paths.config, cfg)?;
        self.commit_all("chore: configure factory")?;
        Ok(paths)
    }

    /// Write scenario documents under `scenarios/` and commit them.
    pub fn add_scenarios(&self, scenarios: &[(&str, &str)]) -> Result<String> {
        for (name, command) in scenarios {
            self.write(
                &format!("scenarios/{name}.md"),
                &scenario_doc(name, "cli", command),
            )?;
        }
        self.commit_all("test: add holdout scenarios")
    }

    fn git_raw(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// A complete scenario document whose evaluation method runs `command`.
pub fn scenario_doc(name: &str, category: &str, command: &str) -> String {
    format!(
        "# Scenario: {name}\n\n\
         ## Category\n{category}\n\n\
         ## Preconditions\n- the project builds\n\n\
         ## Behavioral Expectation\n{name} behaves as documented.\n\n\
         ## Evaluation Method\n```bash\n{command}\n```\n\n\
         ## Pass Criteria\nThe command exits 0.\n\n\
         ## Evidence Required\n- command output\n"
    )
}

/// One scripted agent turn: files to write, then the exit code to report.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgentStep {
    pub writes: Vec<(String, String)>,
    pub exit_code: i32,
}

impl ScriptedAgentStep {
    pub fn writes(files: &[(&str, &str)]) -> Self {
        Self {
            writes: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            exit_code: 0,
        }
    }
}

/// What a scripted agent saw when it was invoked.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub iteration: u64,
    pub feedback: String,
    pub holdout_present: bool,
}

/// Agent that replays queued steps and records every call.
pub struct ScriptedAgent {
    holdout_dir: String,
    steps: RefCell<VecDeque<ScriptedAgentStep>>,
    calls: RefCell<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedAgentStep>) -> Self {
        Self {
            holdout_dir: "scenarios".to_string(),
            steps: RefCell::new(steps.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.calls.borrow_mut().push(AgentCall {
            iteration: request.iteration,
            feedback: request.feedback.clone(),
            holdout_present: request.workdir.join(&self.holdout_dir).exists(),
        });
        let Some(step) = self.steps.borrow_mut().pop_front() else {
            bail!("scripted agent has no step for iteration {}", request.iteration);
        };
        for (rel, contents) in &step.writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents)?;
        }
        Ok(AgentRun {
            exit_code: Some(step.exit_code),
            timed_out: false,
        })
    }
}

/// Reviewer returning queued findings; an empty queue reviews clean.
#[derive(Default)]
pub struct ScriptedReviewer {
    reviews: RefCell<VecDeque<Vec<Finding>>>,
}

impl ScriptedReviewer {
    pub fn new(reviews: Vec<Vec<Finding>>) -> Self {
        Self {
            reviews: RefCell::new(reviews.into()),
        }
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(&self, _request: &ReviewRequest) -> Result<Vec<Finding>> {
        Ok(self.reviews.borrow_mut().pop_front().unwrap_or_default())
    }
}

/// Gate-1 returning queued exit codes; an empty queue passes.
#[derive(Default)]
pub struct ScriptedGate1 {
    outcomes: RefCell<VecDeque<(i32, String)>>,
}

impl ScriptedGate1 {
    pub fn new(outcomes: Vec<(i32, &str)>) -> Self {
        Self {
            outcomes: RefCell::new(
                outcomes
                    .into_iter()
                    .map(|(code, log)| (code, log.to_string()))
                    .collect(),
            ),
        }
    }
}

impl DeterministicGate for ScriptedGate1 {
    fn run(&self, request: &Gate1Request) -> Result<DeterministicOutcome> {
        let (code, log) = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or((0, "ok\n".to_string()));
        crate::io::iteration_log::write_text(&request.log_path, &log)?;
        Ok(DeterministicOutcome {
            exit_code: Some(code),
            timed_out: false,
            log,
        })
    }
}
