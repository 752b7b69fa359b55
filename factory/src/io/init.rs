//! Initialization helpers for `.factory/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{FactoryConfig, write_config};
use crate::io::paths::FactoryPaths;

/// Options for `init_factory`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing factory-owned files.
    pub force: bool,
}

/// Create `.factory/` scaffolding in `root`.
///
/// Fails if `.factory/config.toml` already exists unless `options.force` is set.
/// Durable state (counter, iteration log) is never touched.
pub fn init_factory(root: &Path, options: &InitOptions) -> Result<FactoryPaths> {
    let paths = FactoryPaths::new(root);
    if paths.factory_dir.exists() && !paths.factory_dir.is_dir() {
        return Err(anyhow!(
            "factory init: .factory exists but is not a directory"
        ));
    }
    if paths.config.exists() && !options.force {
        return Err(anyhow!(
            "factory init: {} already exists (use --force to overwrite)",
            paths.config.display()
        ));
    }

    for dir in [
        &paths.factory_dir,
        &paths.state_dir,
        &paths.iterations_dir,
        &paths.feedback_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore, FACTORY_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore.display()))?;
    write_config(&paths.config, &FactoryConfig::default())?;
    Ok(paths)
}

const FACTORY_GITIGNORE: &str = "state/\niterations/\nfeedback/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    /// Verifies init creates the directories, the gitignore and a loadable default config.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_factory(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.iterations_dir.is_dir());
        assert!(paths.feedback_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore).expect("gitignore"),
            FACTORY_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config).expect("config"),
            FactoryConfig::default()
        );
    }

    /// Verifies init refuses to overwrite without --force and keeps state with it.
    #[test]
    fn init_requires_force_and_keeps_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_factory(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_factory(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        fs::write(&paths.config, "max_iterations = 3\n").expect("customize");
        fs::write(&paths.iteration_counter, "{\"iteration\": 5}\n").expect("counter");
        init_factory(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(load_config(&paths.config).expect("config").max_iterations, 10);
        assert!(paths.iteration_counter.exists());
    }
}
