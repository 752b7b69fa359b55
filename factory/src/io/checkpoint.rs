//! In-flight iteration checkpoint (`.factory/state/checkpoint.json`).
//!
//! Written at every state transition and removed once the iteration record is
//! appended. A leftover checkpoint means an iteration was interrupted.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::state::IterationState;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub iteration: u64,
    pub state: IterationState,
    /// Snapshot the holdout must be restored from.
    pub restore_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_commit: Option<String>,
    pub updated_at: String,
}

pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    Ok(Some(checkpoint))
}

pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    debug!(iteration = checkpoint.iteration, state = %checkpoint.state, "writing checkpoint");
    write_json_atomic(path, checkpoint)
}

pub fn clear_checkpoint(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove checkpoint {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trips_and_clears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        assert_eq!(load_checkpoint(&path).expect("missing"), None);

        let checkpoint = Checkpoint {
            iteration: 4,
            state: IterationState::AwaitAgent,
            restore_ref: "0123abcd".to_string(),
            strip_commit: Some("feedbeef".to_string()),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        write_checkpoint(&path, &checkpoint).expect("write");
        assert_eq!(load_checkpoint(&path).expect("load"), Some(checkpoint));

        clear_checkpoint(&path).expect("clear");
        clear_checkpoint(&path).expect("clear twice");
        assert!(!path.exists());
    }
}
