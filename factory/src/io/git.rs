//! Git adapter for isolation and merge checkpoints.
//!
//! Every isolation operation and every merged agent change is recorded as a
//! commit, so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full commit SHA that `reference` names.
    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        let commit = format!("{reference}^{{commit}}");
        self.stdout(&["rev-parse", "--verify", "--quiet", &commit])
            .map(|sha| sha.trim().to_string())
            .with_context(|| format!("'{reference}' is not a commit"))
    }

    pub fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    /// Every pending change in the worktree, untracked files included.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        self.stdout(&["status", "--porcelain=v1", "-uall"])?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Fail unless every pending change lives under one of `allowed_prefixes`.
    ///
    /// The factory commits the agent's work wholesale, so unrelated local
    /// edits would be swept into a merge commit.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let stray: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .filter(|e| !allowed_prefixes.iter().any(|p| e.path.starts_with(p)))
            .map(|e| format!("{} {}", e.code, e.path))
            .collect();
        if stray.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(stray = stray.len(), "worktree not clean");
        Err(anyhow!(
            "working tree has uncommitted changes outside .factory/:\n{}",
            stray.join("\n")
        ))
    }

    /// Tracked files under `dir` at `reference`, sorted.
    pub fn ls_tree_files(&self, reference: &str, dir: &str) -> Result<Vec<String>> {
        let out = self.stdout(&["ls-tree", "-r", "-z", "--name-only", reference, "--", dir])?;
        let mut files: Vec<String> = out
            .split('\0')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Raw bytes of `path` at `reference`.
    pub fn show_blob(&self, reference: &str, path: &str) -> Result<Vec<u8>> {
        let object = format!("{reference}:{path}");
        Ok(self.git(&["show", &object])?.stdout)
    }

    /// Overwrite `paths` in the index and working tree with their content at `reference`.
    #[instrument(skip_all, fields(reference))]
    pub fn checkout_paths(&self, reference: &str, paths: &[&str]) -> Result<()> {
        debug!(reference, ?paths, "checking out paths from ref");
        let mut args = vec!["checkout", reference, "--"];
        args.extend_from_slice(paths);
        self.git(&args)?;
        Ok(())
    }

    /// Subject line of the HEAD commit.
    pub fn head_subject(&self) -> Result<String> {
        let out = self.stdout(&["log", "-1", "--format=%s"])?;
        Ok(out.trim().to_string())
    }

    /// Newest commit whose subject starts with `prefix`, if any.
    pub fn last_commit_with_subject_prefix(&self, prefix: &str) -> Result<Option<String>> {
        let out = self.stdout(&["log", "--format=%H %s"])?;
        Ok(out.lines().find_map(|line| {
            let (sha, subject) = line.split_once(' ')?;
            subject.starts_with(prefix).then(|| sha.to_string())
        }))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.git(&["add", "-A"])?;
        Ok(())
    }

    /// Stage additions, modifications and deletions under `paths`.
    pub fn add_paths(&self, paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend_from_slice(paths);
        self.git(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    fn has_staged_changes(&self) -> Result<bool> {
        Ok(!self.stdout(&["diff", "--cached", "--name-only"])?.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.git(&["commit", "-m", message])?;
        Ok(true)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `git args...` in the workdir, failing on a non-zero exit.
    fn git(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if output.status.success() {
            return Ok(output);
        }
        Err(anyhow!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.code, "R ");
        assert_eq!(e.path, "new.txt");
    }

    /// Only changes under an allowed prefix are tolerated.
    #[test]
    fn clean_check_ignores_allowed_prefixes() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        repo.write(".factory/state/iteration.json", "{}").expect("state");
        git.ensure_clean_except_prefixes(&[".factory/"])
            .expect("allowed");

        repo.write("notes.txt", "wip").expect("stray");
        let err = git
            .ensure_clean_except_prefixes(&[".factory/"])
            .expect_err("stray change");
        assert!(err.to_string().contains("?? notes.txt"));
    }

    #[test]
    fn ls_tree_and_subject_lookup() {
        let repo = TestRepo::new().expect("repo");
        repo.write("scenarios/b.md", "b").expect("b");
        repo.write("scenarios/a.md", "a").expect("a");
        let first = repo.commit_all("[marker] add scenarios").expect("commit");
        repo.write("other.txt", "x").expect("other");
        repo.commit_all("chore: other").expect("commit");

        let git = repo.git();
        assert_eq!(
            git.ls_tree_files("HEAD", "scenarios").expect("ls-tree"),
            vec!["scenarios/a.md", "scenarios/b.md"]
        );
        assert_eq!(git.show_blob(&first, "scenarios/a.md").expect("blob"), b"a");
        assert_eq!(
            git.last_commit_with_subject_prefix("[marker]").expect("log"),
            Some(first)
        );
        assert_eq!(git.last_commit_with_subject_prefix("[none]").expect("log"), None);
    }
}
