//! Scenario discovery from the holdout directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::scenario::Scenario;
use crate::core::scenario_format::parse_scenario;

/// Parse every `*.md` file directly under `root/holdout_dir`, sorted by path.
///
/// A missing directory (stripped holdout) yields an empty set. A malformed
/// document fails the whole discovery with its
/// [`ScenarioFormatError`](crate::error::ScenarioFormatError).
pub fn discover(root: &Path, holdout_dir: &str) -> Result<Vec<Scenario>> {
    let dir = root.join(holdout_dir);
    if !dir.exists() {
        debug!(dir = %dir.display(), "holdout directory absent");
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    files.sort();

    let mut scenarios = Vec::with_capacity(files.len());
    for path in files {
        let content =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let rel = path.strip_prefix(root).unwrap_or(&path);
        scenarios.push(parse_scenario(rel, &content)?);
    }
    debug!(count = scenarios.len(), "scenarios discovered");
    Ok(scenarios)
}
