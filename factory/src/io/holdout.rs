//! Holdout isolation: strip the scenario directory before the agent runs and
//! restore it byte-for-byte afterwards.
//!
//! Both operations verify their result and record exactly one marker commit
//! (unless nothing changed, or the caller asked for `--no-commit`). A dry run
//! only reports what would change.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::build_targets::{disable_targets, enable_targets, enabled_targets};
use crate::error::IsolationError;
use crate::io::config::HoldoutConfig;
use crate::io::git::Git;

pub const STRIP_MARKER: &str = "[factory:holdout-stripped]";
pub const RESTORE_MARKER: &str = "[factory:holdout-restored]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolationOptions {
    /// Report the plan without touching the tree.
    pub dry_run: bool,
    /// Mutate and verify, but leave the result uncommitted.
    pub no_commit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationOperation {
    Strip,
    Restore,
}

/// What an isolation operation did (or would do, for a dry run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationReceipt {
    pub operation: IsolationOperation,
    pub holdout_dir: String,
    /// Holdout files removed or restored, relative to the project root.
    pub files: Vec<String>,
    /// Ancillary paths removed (strip only).
    pub ancillary: Vec<String>,
    /// Build targets disabled or re-enabled.
    pub targets: Vec<String>,
    /// SHA-256 over the holdout files (path and content) that were removed or restored.
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub dry_run: bool,
}

/// Strips and restores the holdout directory of one working tree.
///
/// Assumes a single writer: never call concurrently on the same tree.
pub struct HoldoutIsolator<'a> {
    root: PathBuf,
    cfg: &'a HoldoutConfig,
    git: Git,
}

impl<'a> HoldoutIsolator<'a> {
    pub fn new(root: &Path, cfg: &'a HoldoutConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            cfg,
            git: Git::new(root),
        }
    }

    fn dir_rel(&self) -> &str {
        self.cfg.dir.trim().trim_end_matches('/')
    }

    fn dir_abs(&self) -> PathBuf {
        self.root.join(self.dir_rel())
    }

    fn build_file(&self) -> PathBuf {
        self.root.join(&self.cfg.build_file)
    }

    /// Remove the holdout, disable its build targets, verify, then commit.
    #[instrument(skip_all, fields(dir = %self.cfg.dir, dry_run = opts.dry_run))]
    pub fn strip(&self, opts: IsolationOptions) -> Result<IsolationReceipt> {
        self.ensure_holdout_committed()?;
        let files = list_files(&self.root, &self.dir_abs())?;
        let content_hash = digest_working_tree(&self.root, &files)?;
        let ancillary: Vec<String> = self
            .cfg
            .ancillary_paths
            .iter()
            .filter(|p| self.root.join(p).exists())
            .cloned()
            .collect();

        let build_file = self.build_file();
        let build_contents = read_optional(&build_file)?;
        let toggle = build_contents
            .as_deref()
            .map(|c| disable_targets(c, &self.cfg.build_targets));
        let targets = toggle.as_ref().map(|t| t.changed.clone()).unwrap_or_default();

        let mut receipt = IsolationReceipt {
            operation: IsolationOperation::Strip,
            holdout_dir: self.dir_rel().to_string(),
            files,
            ancillary,
            targets,
            content_hash,
            reference: None,
            commit: None,
            dry_run: opts.dry_run,
        };
        if opts.dry_run {
            info!(files = receipt.files.len(), "dry run: holdout strip planned");
            return Ok(receipt);
        }

        // Resolve tracked ancillary paths before deleting them.
        let mut pathspecs: Vec<String> = Vec::new();
        for path in &receipt.ancillary {
            if !self.git.ls_tree_files("HEAD", path)?.is_empty() {
                pathspecs.push(path.clone());
            }
        }

        let dir = self.dir_abs();
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        for path in &receipt.ancillary {
            remove_path(&self.root.join(path))?;
        }
        if let Some(toggle) = &toggle
            && !toggle.changed.is_empty()
        {
            fs::write(&build_file, &toggle.contents)
                .with_context(|| format!("write {}", build_file.display()))?;
        }

        self.verify_stripped()?;

        if !receipt.files.is_empty() {
            pathspecs.push(self.dir_rel().to_string());
        }
        if !receipt.targets.is_empty() {
            pathspecs.push(self.cfg.build_file.clone());
        }
        if !opts.no_commit {
            let message = format!(
                "{STRIP_MARKER} strip {} ({} files, targets: {})",
                self.dir_rel(),
                receipt.files.len(),
                list_or_none(&receipt.targets)
            );
            receipt.commit = self.commit(&pathspecs, &message)?;
            let remaining = self.git.ls_tree_files("HEAD", self.dir_rel())?;
            if !remaining.is_empty() {
                return Err(IsolationError::StripVerification { remaining }.into());
            }
        }
        info!(
            files = receipt.files.len(),
            targets = receipt.targets.len(),
            commit = ?receipt.commit,
            "holdout stripped"
        );
        Ok(receipt)
    }

    /// Zero holdout files on disk, no ancillary paths, no enabled holdout targets.
    pub fn verify_stripped(&self) -> Result<()> {
        let mut remaining = list_files(&self.root, &self.dir_abs())?;
        for path in &self.cfg.ancillary_paths {
            if self.root.join(path).exists() {
                remaining.push(path.clone());
            }
        }
        if !remaining.is_empty() {
            warn!(remaining = remaining.len(), "holdout strip verification failed");
            return Err(IsolationError::StripVerification { remaining }.into());
        }
        if let Some(contents) = read_optional(&self.build_file())?
            && let Some(target) = enabled_targets(&contents, &self.cfg.build_targets)
                .into_iter()
                .next()
        {
            return Err(IsolationError::TargetStillEnabled {
                file: PathBuf::from(&self.cfg.build_file),
                target,
            }
            .into());
        }
        debug!("holdout strip verified");
        Ok(())
    }

    /// Restore the holdout from `reference`, re-enable targets, verify, then commit.
    #[instrument(skip_all, fields(dir = %self.cfg.dir, reference, dry_run = opts.dry_run))]
    pub fn restore(&self, reference: &str, opts: IsolationOptions) -> Result<IsolationReceipt> {
        let sha = self.git.rev_parse(reference)?;
        let files = self.git.ls_tree_files(&sha, self.dir_rel())?;
        if files.is_empty() {
            return Err(IsolationError::NothingToRestore {
                reference: reference.to_string(),
                dir: self.dir_rel().to_string(),
            }
            .into());
        }
        let expected = self.digest_at_ref(&sha, &files)?;

        let build_file = self.build_file();
        let toggle = read_optional(&build_file)?
            .map(|c| enable_targets(&c, &self.cfg.build_targets));
        let targets = toggle.as_ref().map(|t| t.changed.clone()).unwrap_or_default();

        let mut receipt = IsolationReceipt {
            operation: IsolationOperation::Restore,
            holdout_dir: self.dir_rel().to_string(),
            files,
            ancillary: Vec::new(),
            targets,
            content_hash: expected.clone(),
            reference: Some(sha.clone()),
            commit: None,
            dry_run: opts.dry_run,
        };
        if opts.dry_run {
            info!(files = receipt.files.len(), "dry run: holdout restore planned");
            return Ok(receipt);
        }

        let dir = self.dir_abs();
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        self.git.checkout_paths(&sha, &[self.dir_rel()])?;
        if let Some(toggle) = &toggle
            && !toggle.changed.is_empty()
        {
            fs::write(&build_file, &toggle.contents)
                .with_context(|| format!("write {}", build_file.display()))?;
        }

        let on_disk = list_files(&self.root, &dir)?;
        let actual = digest_working_tree(&self.root, &on_disk)?;
        if on_disk != receipt.files || actual != expected {
            warn!(%expected, %actual, "holdout restore verification failed");
            return Err(IsolationError::RestoreMismatch {
                reference: reference.to_string(),
                expected,
                actual,
            }
            .into());
        }

        let mut pathspecs = vec![self.dir_rel().to_string()];
        if !receipt.targets.is_empty() {
            pathspecs.push(self.cfg.build_file.clone());
        }
        if !opts.no_commit {
            let short: String = sha.chars().take(12).collect();
            let message = format!(
                "{RESTORE_MARKER} restore {} from {short} ({} files, targets: {})",
                self.dir_rel(),
                receipt.files.len(),
                list_or_none(&receipt.targets)
            );
            receipt.commit = self.commit(&pathspecs, &message)?;
        }
        info!(
            files = receipt.files.len(),
            commit = ?receipt.commit,
            "holdout restored"
        );
        Ok(receipt)
    }

    /// Reference a bare `restore` uses: the configured override, else the
    /// parent of the newest strip commit.
    pub fn default_restore_ref(&self) -> Result<String> {
        if let Some(reference) = &self.cfg.restore_ref {
            return Ok(reference.clone());
        }
        match self.git.last_commit_with_subject_prefix(STRIP_MARKER)? {
            Some(strip) => Ok(format!("{strip}^")),
            None => bail!("no strip commit found; pass --ref to choose what to restore"),
        }
    }

    fn commit(&self, pathspecs: &[String], message: &str) -> Result<Option<String>> {
        let specs: Vec<&str> = pathspecs.iter().map(String::as_str).collect();
        self.git.add_paths(&specs)?;
        if self.git.commit_staged(message)? {
            return Ok(Some(self.git.head_sha()?));
        }
        debug!("nothing to commit");
        Ok(None)
    }

    /// Refuse to strip holdout content that a restore could not bring back.
    fn ensure_holdout_committed(&self) -> Result<()> {
        let prefix = format!("{}/", self.dir_rel());
        let dirty: Vec<String> = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|e| e.path.starts_with(&prefix))
            .map(|e| format!("{} {}", e.code, e.path))
            .collect();
        if !dirty.is_empty() {
            bail!(
                "holdout has uncommitted changes; commit them before stripping:\n{}",
                dirty.join("\n")
            );
        }
        Ok(())
    }

    fn digest_at_ref(&self, sha: &str, files: &[String]) -> Result<String> {
        let mut hasher = Sha256::new();
        for file in files {
            let blob = self.git.show_blob(sha, file)?;
            update_digest(&mut hasher, file, &blob);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Files (and symlinks) under `dir`, relative to `root` with `/` separators, sorted.
pub fn list_files(root: &Path, dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} outside root", entry.path().display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

/// SHA-256 over `path NUL content NUL` for each file, in the given (sorted) order.
pub fn digest_working_tree(root: &Path, files: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let path = root.join(file);
        let meta = fs::symlink_metadata(&path).with_context(|| format!("stat {}", path.display()))?;
        let bytes = if meta.file_type().is_symlink() {
            fs::read_link(&path)
                .with_context(|| format!("read link {}", path.display()))?
                .to_string_lossy()
                .into_owned()
                .into_bytes()
        } else {
            fs::read(&path).with_context(|| format!("read {}", path.display()))?
        };
        update_digest(&mut hasher, file, &bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn update_digest(hasher: &mut Sha256, path: &str, content: &[u8]) {
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    hasher.update([0u8]);
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
