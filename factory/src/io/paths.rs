//! Well-known locations under `.factory/`.

use std::path::{Path, PathBuf};

/// Directory (relative to the project root) holding all factory state.
pub const FACTORY_DIR: &str = ".factory";

/// Paths for one project root.
#[derive(Debug, Clone)]
pub struct FactoryPaths {
    pub root: PathBuf,
    pub factory_dir: PathBuf,
    pub config: PathBuf,
    pub gitignore: PathBuf,
    pub state_dir: PathBuf,
    pub iteration_counter: PathBuf,
    pub iteration_log: PathBuf,
    pub checkpoint: PathBuf,
    pub iterations_dir: PathBuf,
    pub feedback_dir: PathBuf,
    pub latest_feedback: PathBuf,
}

impl FactoryPaths {
    pub fn new(root: &Path) -> Self {
        let factory_dir = root.join(FACTORY_DIR);
        let state_dir = factory_dir.join("state");
        let feedback_dir = factory_dir.join("feedback");
        Self {
            root: root.to_path_buf(),
            config: factory_dir.join("config.toml"),
            gitignore: factory_dir.join(".gitignore"),
            iteration_counter: state_dir.join("iteration.json"),
            iteration_log: state_dir.join("iterations.jsonl"),
            checkpoint: state_dir.join("checkpoint.json"),
            iterations_dir: factory_dir.join("iterations"),
            latest_feedback: feedback_dir.join("latest.md"),
            feedback_dir,
            state_dir,
            factory_dir,
        }
    }

    pub fn feedback_for(&self, iteration: u64) -> PathBuf {
        self.feedback_dir.join(format!("feedback_iter_{iteration}.md"))
    }
}
