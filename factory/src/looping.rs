//! Multi-iteration looping helper for `factory loop`.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::core::judge::Decision;
use crate::io::agent::Agent;
use crate::io::gate1::DeterministicGate;
use crate::orchestrator::{Collaborators, IterationOutcome, run_iteration};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The judge declared the implementation converged.
    Converged { iteration: u64 },
    /// The judge escalated to a human.
    Escalated { iteration: u64, reasons: Vec<String> },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations_run: u64,
    pub stop: LoopStop,
}

impl LoopOutcome {
    pub fn converged(&self) -> bool {
        matches!(self.stop, LoopStop::Converged { .. })
    }
}

/// Run iterations until the judge converges or escalates.
///
/// Termination relies on the judge escalating once `max_iterations` is
/// reached. Any error aborts the loop; an interrupted iteration has already
/// been rolled forward by then.
pub fn run_loop<A: Agent, G: DeterministicGate, F: FnMut(&IterationOutcome)>(
    root: &Path,
    collab: &Collaborators<'_, A, G>,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let mut iterations_run = 0u64;
    loop {
        let outcome = run_iteration(root, collab)?;
        iterations_run += 1;
        on_iteration(&outcome);
        let stop = match outcome.decision() {
            Decision::Loop => continue,
            Decision::Converged => LoopStop::Converged {
                iteration: outcome.iteration,
            },
            Decision::Escalate => LoopStop::Escalated {
                iteration: outcome.iteration,
                reasons: outcome.verdict.reasons.clone(),
            },
        };
        info!(iterations_run, ?stop, "loop finished");
        return Ok(LoopOutcome {
            iterations_run,
            stop,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::{FactoryConfig, JudgeConfig};
    use crate::io::nfr::NfrRegistry;
    use crate::test_support::{ScriptedAgent, ScriptedAgentStep, ScriptedGate1, TestRepo};

    #[test]
    fn loop_runs_until_converged() {
        let repo = TestRepo::new().expect("repo");
        repo.init_factory(&FactoryConfig::default()).expect("factory");
        repo.add_scenarios(&[("ready", "test -f ready.txt")])
            .expect("scenarios");

        let agent = ScriptedAgent::new(vec![
            ScriptedAgentStep::writes(&[("notes.txt", "thinking\n")]),
            ScriptedAgentStep::writes(&[("ready.txt", "ok\n")]),
        ]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        let mut seen = Vec::new();
        let outcome = run_loop(repo.path(), &collab, |o| seen.push(o.decision())).expect("loop");
        assert_eq!(outcome.iterations_run, 2);
        assert_eq!(outcome.stop, LoopStop::Converged { iteration: 2 });
        assert_eq!(seen, vec![Decision::Loop, Decision::Converged]);
    }

    /// The same failure signature across the stall window escalates.
    #[test]
    fn loop_escalates_on_repeated_failure() {
        let repo = TestRepo::new().expect("repo");
        repo.init_factory(&FactoryConfig {
            judge: JudgeConfig {
                stall_window: 2,
                ..JudgeConfig::default()
            },
            ..FactoryConfig::default()
        })
        .expect("factory");
        repo.add_scenarios(&[("never", "echo broken >&2; exit 1")])
            .expect("scenarios");

        let agent = ScriptedAgent::new(vec![ScriptedAgentStep::default(); 3]);
        let gate1 = ScriptedGate1::default();
        let nfr = NfrRegistry::new();
        let collab = Collaborators {
            agent: &agent,
            reviewer: None,
            gate1: &gate1,
            nfr: &nfr,
        };

        let outcome = run_loop(repo.path(), &collab, |_| {}).expect("loop");
        assert_eq!(outcome.iterations_run, 2);
        match outcome.stop {
            LoopStop::Escalated { iteration, reasons } => {
                assert_eq!(iteration, 2);
                assert!(reasons.iter().any(|r| r.starts_with("stalled")));
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }
}
