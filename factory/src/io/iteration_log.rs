//! Iteration records (`.factory/state/iterations.jsonl`) and per-iteration
//! artifacts (`.factory/iterations/<n>/`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::debug;

use crate::core::feedback::FeedbackDocument;
use crate::core::judge::Verdict;
use crate::core::nfr::NfrReport;
use crate::core::record::IterationRecord;
use crate::core::scenario::ScenarioRunSummary;
use crate::core::types::GateResult;

/// Load every record, oldest first. A missing log is empty.
pub fn load_records(path: &Path) -> Result<Vec<IterationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read iteration log {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: IterationRecord = serde_json::from_str(line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Append one record. Iteration numbers must strictly increase.
pub fn append_record(path: &Path, record: &IterationRecord) -> Result<()> {
    if let Some(last) = load_records(path)?.last()
        && record.iteration <= last.iteration
    {
        bail!(
            "iteration log is append-only: record {} does not follow {}",
            record.iteration,
            last.iteration
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize iteration record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open iteration log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append iteration log {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync iteration log {}", path.display()))?;
    debug!(iteration = record.iteration, decision = ?record.decision, "iteration record appended");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub gate_results_path: PathBuf,
    pub scenario_results_path: PathBuf,
    pub nfr_report_path: PathBuf,
    pub verdict_path: PathBuf,
    pub feedback_json_path: PathBuf,
    pub feedback_md_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub agent_stream_path: PathBuf,
    pub review_log_path: PathBuf,
    pub gate1_log_path: PathBuf,
    pub error_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iteration: u64) -> Self {
        let dir = iterations_dir.join(iteration.to_string());
        Self {
            gate_results_path: dir.join("gate_results.json"),
            scenario_results_path: dir.join("scenario_results.json"),
            nfr_report_path: dir.join("nfr_report.json"),
            verdict_path: dir.join("verdict.json"),
            feedback_json_path: dir.join("feedback.json"),
            feedback_md_path: dir.join("feedback.md"),
            agent_log_path: dir.join("agent.log"),
            agent_stream_path: dir.join("agent.stream.log"),
            review_log_path: dir.join("review.log"),
            gate1_log_path: dir.join("gate1.log"),
            error_log_path: dir.join("factory_error.log"),
            dir,
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub paths: &'a IterationPaths,
    pub gate_results: &'a [GateResult],
    pub scenarios: Option<&'a ScenarioRunSummary>,
    pub nfr: Option<&'a NfrReport>,
    pub verdict: &'a Verdict,
    pub feedback: &'a FeedbackDocument,
    pub feedback_markdown: &'a str,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<()> {
    let paths = request.paths;
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.gate_results_path, &request.gate_results)?;
    if let Some(scenarios) = request.scenarios {
        write_json(&paths.scenario_results_path, scenarios)?;
    }
    if let Some(nfr) = request.nfr {
        write_json(&paths.nfr_report_path, nfr)?;
    }
    write_json(&paths.verdict_path, request.verdict)?;
    write_json(&paths.feedback_json_path, request.feedback)?;
    write_text(&paths.feedback_md_path, request.feedback_markdown)?;
    Ok(())
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::judge::Decision;

    fn record(iteration: u64) -> IterationRecord {
        IterationRecord {
            iteration,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            gate_results: Vec::new(),
            satisfaction_score: Some(0.5),
            decision: Decision::Loop,
            failure_signatures: vec!["scenario:a|x".to_string()],
            restore_ref: Some("abc".to_string()),
            merge_commit: None,
            agent_exit_code: Some(0),
        }
    }

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(&temp.path().join(".factory/iterations"), 3);
        assert!(paths.dir.ends_with(Path::new(".factory/iterations/3")));
        assert!(paths.gate_results_path.ends_with("gate_results.json"));
        assert!(paths.feedback_md_path.ends_with("feedback.md"));
        assert!(paths.gate1_log_path.ends_with("gate1.log"));
    }

    #[test]
    fn append_then_load_preserves_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("iterations.jsonl");
        assert!(load_records(&path).expect("empty").is_empty());

        append_record(&path, &record(1)).expect("append 1");
        append_record(&path, &record(2)).expect("append 2");
        let records = load_records(&path).expect("load");
        assert_eq!(records, vec![record(1), record(2)]);
    }

    #[test]
    fn rejects_non_monotonic_append() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("iterations.jsonl");
        append_record(&path, &record(2)).expect("append");
        let err = append_record(&path, &record(2)).expect_err("duplicate");
        assert!(err.to_string().contains("append-only"));
        assert_eq!(load_records(&path).expect("load").len(), 1);
    }
}
