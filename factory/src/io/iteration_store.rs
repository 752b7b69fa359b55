//! Durable iteration counter (`.factory/state/iteration.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct CounterFile {
    iteration: u64,
}

/// Process-wide iteration counter, durable across restarts. Starts at 0.
#[derive(Debug, Clone)]
pub struct IterationStore {
    path: PathBuf,
    current: u64,
}

impl IterationStore {
    /// Load the counter; a missing file means no iteration has run yet.
    pub fn load(path: &Path) -> Result<Self> {
        let current = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read iteration counter {}", path.display()))?;
            let file: CounterFile = serde_json::from_str(&contents)
                .with_context(|| format!("parse iteration counter {}", path.display()))?;
            file.iteration
        } else {
            0
        };
        debug!(path = %path.display(), current, "iteration counter loaded");
        Ok(Self {
            path: path.to_path_buf(),
            current,
        })
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Advance the counter and persist it before returning the new value.
    pub fn increment(&mut self) -> Result<u64> {
        let next = self.current + 1;
        write_json_atomic(&self.path, &CounterFile { iteration: next })
            .with_context(|| format!("persist iteration counter {}", self.path.display()))?;
        self.current = next;
        debug!(iteration = next, "iteration counter advanced");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_persists_increments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("iteration.json");

        let mut store = IterationStore::load(&path).expect("load");
        assert_eq!(store.current(), 0);
        assert_eq!(store.increment().expect("increment"), 1);
        assert_eq!(store.increment().expect("increment"), 2);

        let reloaded = IterationStore::load(&path).expect("reload");
        assert_eq!(reloaded.current(), 2);
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "{\n  \"iteration\": 2\n}\n"
        );
    }
}
