//! Roll an interrupted iteration forward so the tree is never left stripped.
//!
//! Recovery never reverts anything: pending agent work is merged, the holdout
//! is restored from the checkpointed reference, and the interrupted iteration
//! is logged as a LOOP with every gate skipped.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::judge::Decision;
use crate::core::record::IterationRecord;
use crate::core::state::IterationState;
use crate::core::types::{GateId, GateResult};
use crate::io::checkpoint::{Checkpoint, clear_checkpoint, load_checkpoint};
use crate::io::clock::now_rfc3339;
use crate::io::config::{FactoryConfig, load_config};
use crate::io::git::Git;
use crate::io::holdout::{HoldoutIsolator, IsolationOptions};
use crate::io::iteration_log::{append_record, load_records};
use crate::io::paths::FactoryPaths;

pub const MERGE_MARKER: &str = "[factory:merge]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverOutcome {
    pub iteration: u64,
    pub interrupted_in: IterationState,
    pub merge_commit: Option<String>,
    pub restore_commit: Option<String>,
}

/// Recover from the checkpoint under `root`, if any.
pub fn recover(root: &Path) -> Result<Option<RecoverOutcome>> {
    let paths = FactoryPaths::new(root);
    let cfg = load_config(&paths.config)?;
    let Some(checkpoint) = load_checkpoint(&paths.checkpoint)? else {
        info!("no interrupted iteration to recover");
        return Ok(None);
    };
    roll_forward(&paths, &cfg, &checkpoint).map(Some)
}

/// Merge pending work, restore the holdout, log the iteration, clear the checkpoint.
pub fn roll_forward(
    paths: &FactoryPaths,
    cfg: &FactoryConfig,
    checkpoint: &Checkpoint,
) -> Result<RecoverOutcome> {
    warn!(
        iteration = checkpoint.iteration,
        state = %checkpoint.state,
        "rolling interrupted iteration forward"
    );
    let git = Git::new(&paths.root);
    let mut merge_commit = None;
    let mut restore_commit = None;

    let before_restore = matches!(
        checkpoint.state,
        IterationState::StripHoldout | IterationState::RestoreHoldout
    ) || checkpoint.state.holdout_stripped();
    if before_restore {
        if checkpoint.state.holdout_stripped() {
            merge_commit = merge_agent_work(&git, checkpoint.iteration, true)?;
        }
        let receipt = HoldoutIsolator::new(&paths.root, &cfg.holdout)
            .restore(&checkpoint.restore_ref, IsolationOptions::default())
            .with_context(|| format!("restore holdout from {}", checkpoint.restore_ref))?;
        restore_commit = receipt.commit;
    }

    let logged = load_records(&paths.iteration_log)?
        .last()
        .is_some_and(|r| r.iteration >= checkpoint.iteration);
    if !logged {
        let reason = format!("iteration interrupted in {}", checkpoint.state);
        append_record(
            &paths.iteration_log,
            &IterationRecord {
                iteration: checkpoint.iteration,
                timestamp: now_rfc3339(),
                gate_results: GateId::ALL
                    .iter()
                    .map(|gate| GateResult::skipped(*gate, reason.clone()))
                    .collect(),
                satisfaction_score: None,
                decision: Decision::Loop,
                failure_signatures: Vec::new(),
                restore_ref: Some(checkpoint.restore_ref.clone()),
                merge_commit: merge_commit.clone(),
                agent_exit_code: None,
            },
        )?;
    }
    clear_checkpoint(&paths.checkpoint)?;
    info!(iteration = checkpoint.iteration, "interrupted iteration recovered");
    Ok(RecoverOutcome {
        iteration: checkpoint.iteration,
        interrupted_in: checkpoint.state,
        merge_commit,
        restore_commit,
    })
}

/// Commit whatever the agent left in the tree. Returns the commit, if any.
pub fn merge_agent_work(git: &Git, iteration: u64, recovered: bool) -> Result<Option<String>> {
    git.add_all()?;
    let suffix = if recovered { " (recovered)" } else { "" };
    let message = format!("{MERGE_MARKER} iteration {iteration}{suffix}");
    if git.commit_staged(&message)? {
        return Ok(Some(git.head_sha()?));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::checkpoint::write_checkpoint;
    use crate::io::holdout::HoldoutIsolator;
    use crate::test_support::TestRepo;

    #[test]
    fn recovers_stripped_tree_and_keeps_agent_work() {
        let repo = TestRepo::new().expect("repo");
        let paths = repo.init_factory(&FactoryConfig::default()).expect("factory");
        let reference = repo.add_scenarios(&[("smoke", "true")]).expect("scenarios");
        let cfg = FactoryConfig::default();

        let strip = HoldoutIsolator::new(repo.path(), &cfg.holdout)
            .strip(IsolationOptions::default())
            .expect("strip");
        repo.write("src/lib.rs", "pub fn work() {}\n").expect("agent work");
        write_checkpoint(
            &paths.checkpoint,
            &Checkpoint {
                iteration: 1,
                state: IterationState::AwaitAgent,
                restore_ref: reference,
                strip_commit: strip.commit,
                updated_at: now_rfc3339(),
            },
        )
        .expect("checkpoint");

        let outcome = recover(repo.path()).expect("recover").expect("outcome");
        assert_eq!(outcome.interrupted_in, IterationState::AwaitAgent);
        assert!(outcome.merge_commit.is_some());
        assert!(repo.exists("scenarios/smoke.md"));
        assert!(repo.exists("src/lib.rs"));
        assert!(!paths.checkpoint.exists());

        let records = load_records(&paths.iteration_log).expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, Decision::Loop);
        assert!(recover(repo.path()).expect("second").is_none());
    }
}
