//! Typed failure kinds that callers branch on.
//!
//! Everything else flows through `anyhow`; these are recovered with
//! `anyhow::Error::downcast_ref` where the CLI or the orchestrator needs to
//! tell them apart (exit codes, fatal vs recorded).

use std::path::PathBuf;

use thiserror::Error;

/// Holdout strip/restore could not be verified. Always fatal to the iteration.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("holdout still present after strip: {}", .remaining.join(", "))]
    StripVerification { remaining: Vec<String> },

    #[error("restored holdout does not match {reference}: expected digest {expected}, found {actual}")]
    RestoreMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("reference {reference} has no files under {dir}; nothing to restore")]
    NothingToRestore { reference: String, dir: String },

    #[error("build target '{target}' still enabled in {} after strip", .file.display())]
    TargetStillEnabled { file: PathBuf, target: String },
}

/// A scenario definition is missing a mandatory section.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("scenario {}: missing required section '{section}'", .file.display())]
pub struct ScenarioFormatError {
    pub file: PathBuf,
    pub section: &'static str,
}

/// Gate-3 produced a different number of results than scenarios discovered.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("scenario conservation violated: discovered {discovered}, summarized {summarized}")]
pub struct ScenarioConservationError {
    pub discovered: usize,
    pub summarized: usize,
}

/// Configuration was read but is not usable.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
