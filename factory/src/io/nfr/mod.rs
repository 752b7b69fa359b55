//! Gate-2 non-functional checks.
//!
//! A check is registered by name and run independently of every other check.
//! [`NfrRegistry::run_all`] runs them on scoped threads and joins before
//! building the report. A check that errors or panics is reported as an
//! `error` check with a WARNING finding; it never disappears.

pub mod test_quality;
pub mod tool;

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, instrument, warn};

use crate::core::nfr::{NfrCheckReport, NfrReport};
use crate::io::config::NfrConfig;

pub use test_quality::TestQualityCheck;
pub use tool::ToolCheck;

pub trait NfrCheck: Send + Sync {
    fn name(&self) -> &str;
    /// Program (or built-in) the check wraps.
    fn tool(&self) -> &str;
    fn run(&self, root: &Path) -> Result<NfrCheckReport>;
}

#[derive(Default)]
pub struct NfrRegistry {
    checks: BTreeMap<String, Box<dyn NfrCheck>>,
}

impl NfrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in and configured tool checks.
    pub fn from_config(cfg: &NfrConfig) -> Result<Self> {
        let mut registry = Self::new();
        if cfg.test_quality {
            registry.register(TestQualityCheck)?;
        }
        for check in &cfg.checks {
            registry.register(ToolCheck::new(
                &check.name,
                check.command.clone(),
                check.format,
                Duration::from_secs(cfg.timeout_secs),
                cfg.output_limit_bytes,
            ))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, check: impl NfrCheck + 'static) -> Result<()> {
        let name = check.name().to_string();
        if self.checks.contains_key(&name) {
            bail!("nfr check '{name}' is already registered");
        }
        debug!(check = %name, tool = check.tool(), "registered nfr check");
        self.checks.insert(name, Box::new(check));
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.checks.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check concurrently and join.
    #[instrument(skip_all, fields(checks = self.checks.len()))]
    pub fn run_all(&self, root: &Path) -> NfrReport {
        let reports: BTreeMap<String, NfrCheckReport> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .checks
                .iter()
                .map(|(name, check)| (name, check, scope.spawn(move || check.run(root))))
                .collect();
            handles
                .into_iter()
                .map(|(name, check, handle)| {
                    let report = match handle.join() {
                        Ok(result) => settle(name, check.as_ref(), result),
                        Err(_) => {
                            warn!(check = %name, "nfr check panicked");
                            NfrCheckReport::errored(name, check.tool(), "check panicked")
                        }
                    };
                    (name.clone(), report)
                })
                .collect()
        });
        NfrReport::from_checks(reports)
    }

    /// Run a single check by name.
    pub fn run_one(&self, root: &Path, name: &str) -> Result<NfrReport> {
        let Some(check) = self.checks.get(name) else {
            bail!(
                "unknown nfr check '{name}' (registered: {})",
                self.names().join(", ")
            );
        };
        let report = settle(name, check.as_ref(), check.run(root));
        Ok(NfrReport::from_checks(BTreeMap::from([(
            name.to_string(),
            report,
        )])))
    }
}

fn settle(name: &str, check: &dyn NfrCheck, result: Result<NfrCheckReport>) -> NfrCheckReport {
    match result {
        Ok(report) => {
            debug!(check = %name, status = ?report.status, findings = report.findings.len(), "nfr check finished");
            report
        }
        Err(err) => {
            warn!(check = %name, err = %err, "nfr check failed");
            NfrCheckReport::errored(name, check.tool(), format!("{err:#}"))
        }
    }
}
