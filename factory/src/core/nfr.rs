//! NFR report model and external tool output parsing.
//!
//! Parsing never drops a tool failure: unparsable output, or a nonzero exit
//! with nothing parsed, becomes at least one WARNING finding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{Finding, Severity, sort_by_severity};

/// Outcome classification for one NFR check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NfrCheckStatus {
    /// No findings at WARNING or above.
    Passed,
    /// At least one WARNING or CRITICAL finding.
    Failed,
    /// Check disabled or not applicable to this tree.
    Skipped,
    /// The tool could not be invoked or its output could not be read.
    Error,
}

impl NfrCheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NfrCheckStatus::Passed => "passed",
            NfrCheckStatus::Failed => "failed",
            NfrCheckStatus::Skipped => "skipped",
            NfrCheckStatus::Error => "error",
        }
    }
}

/// Result of one NFR check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfrCheckReport {
    pub status: NfrCheckStatus,
    /// Tool or program the check wraps.
    pub tool: String,
    pub summary: String,
    pub findings: Vec<Finding>,
}

impl NfrCheckReport {
    /// Build a report whose status follows from its findings.
    pub fn from_findings(tool: &str, findings: Vec<Finding>) -> Self {
        let status = if findings.iter().any(|f| f.severity >= Severity::Warning) {
            NfrCheckStatus::Failed
        } else {
            NfrCheckStatus::Passed
        };
        let summary = summary_line(&findings);
        Self {
            status,
            tool: tool.to_string(),
            summary,
            findings,
        }
    }

    /// A check that could not run. Carries a WARNING finding explaining why.
    pub fn errored(check: &str, tool: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: NfrCheckStatus::Error,
            tool: tool.to_string(),
            summary: reason.clone(),
            findings: vec![Finding::new(check, Severity::Warning, reason)],
        }
    }

    pub fn skipped(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            status: NfrCheckStatus::Skipped,
            tool: tool.to_string(),
            summary: reason.into(),
            findings: Vec::new(),
        }
    }
}

fn summary_line(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "no findings".to_string();
    }
    let counts = SeverityCounts::tally(findings);
    format!(
        "{} finding(s): {} critical, {} warning, {} nit, {} info",
        findings.len(),
        counts.critical,
        counts.warning,
        counts.nit,
        counts.info
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub warning: usize,
    pub nit: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn tally<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::Critical => counts.critical += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Nit => counts.nit += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }
}

/// Hand-off contract between Gate-2 and feedback/judgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NfrReport {
    pub checks: BTreeMap<String, NfrCheckReport>,
    /// All findings, severity descending.
    pub aggregate: Vec<Finding>,
    pub counts: SeverityCounts,
}

impl NfrReport {
    pub fn from_checks(checks: BTreeMap<String, NfrCheckReport>) -> Self {
        let mut aggregate: Vec<Finding> = checks
            .values()
            .flat_map(|report| report.findings.iter().cloned())
            .collect();
        sort_by_severity(&mut aggregate);
        let counts = SeverityCounts::tally(&aggregate);
        Self {
            checks,
            aggregate,
            counts,
        }
    }

    /// True when any check reported WARNING or worse.
    pub fn has_failures(&self) -> bool {
        self.counts.critical > 0 || self.counts.warning > 0
    }

    /// Findings worth surfacing to the agent (everything above INFO).
    pub fn actionable(&self) -> impl Iterator<Item = &Finding> {
        self.aggregate
            .iter()
            .filter(|f| f.severity > Severity::Info)
    }
}

/// How an external tool's stdout is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// JSON array of `{severity, message, file?, line?}` (or `{"findings": [...]}`).
    FindingsJson,
    /// `cargo --message-format=json` lines.
    CargoDiagnostics,
    /// `path:line[:col]: message` lines.
    Lines,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    severity: String,
    message: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFindings {
    List(Vec<RawFinding>),
    Wrapped { findings: Vec<RawFinding> },
}

/// Parse a tool's output into findings attributed to `check`.
pub fn parse_tool_output(
    check: &str,
    format: OutputFormat,
    stdout: &str,
    exit_code: Option<i32>,
) -> Vec<Finding> {
    let mut findings = match format {
        OutputFormat::FindingsJson => parse_findings_json(check, stdout),
        OutputFormat::CargoDiagnostics => parse_cargo_diagnostics(check, stdout),
        OutputFormat::Lines => parse_lines(check, stdout),
    };
    if findings.is_empty() && exit_code.is_some_and(|code| code != 0) {
        findings.push(Finding::new(
            check,
            Severity::Warning,
            format!(
                "tool exited with status {} but reported no findings",
                exit_code.unwrap_or_default()
            ),
        ));
    }
    findings
}

pub fn parse_findings_json(check: &str, stdout: &str) -> Vec<Finding> {
    if stdout.trim().is_empty() {
        return Vec::new();
    }
    let raw = match serde_json::from_str::<RawFindings>(stdout.trim()) {
        Ok(RawFindings::List(list)) | Ok(RawFindings::Wrapped { findings: list }) => list,
        Err(err) => {
            let mut findings = vec![Finding::new(
                check,
                Severity::Warning,
                format!("unparsable tool output ({err}); falling back to text"),
            )];
            findings.extend(parse_lines(check, stdout));
            return findings;
        }
    };
    raw.into_iter()
        .map(|item| {
            let severity = Severity::parse_label(&item.severity).unwrap_or(Severity::Warning);
            let mut finding = Finding::new(check, severity, item.message);
            if let Some(file) = item.file {
                finding = finding.at(file, item.line);
            }
            finding
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CargoLine {
    reason: String,
    #[serde(default)]
    message: Option<CargoMessage>,
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    level: String,
    message: String,
    #[serde(default)]
    code: Option<CargoCode>,
    #[serde(default)]
    spans: Vec<CargoSpan>,
}

#[derive(Debug, Deserialize)]
struct CargoCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct CargoSpan {
    file_name: String,
    line_start: u32,
    #[serde(default)]
    is_primary: bool,
}

pub fn parse_cargo_diagnostics(check: &str, stdout: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut unparsable = 0usize;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: CargoLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(_) => {
                unparsable += 1;
                continue;
            }
        };
        if parsed.reason != "compiler-message" {
            continue;
        }
        let Some(message) = parsed.message else {
            continue;
        };
        let severity = match message.level.as_str() {
            "error" | "error: internal compiler error" => Severity::Critical,
            "warning" => Severity::Warning,
            "note" | "help" => Severity::Info,
            _ => Severity::Nit,
        };
        // Summary lines like "3 warnings emitted" carry no span.
        let Some(span) = message
            .spans
            .iter()
            .find(|s| s.is_primary)
            .or_else(|| message.spans.first())
        else {
            continue;
        };
        let text = match &message.code {
            Some(code) => format!("{} [{}]", message.message, code.code),
            None => message.message.clone(),
        };
        findings.push(
            Finding::new(check, severity, text).at(span.file_name.clone(), Some(span.line_start)),
        );
    }
    if unparsable > 0 {
        findings.push(Finding::new(
            check,
            Severity::Warning,
            format!("{unparsable} line(s) of tool output were not valid diagnostics JSON"),
        ));
    }
    findings
}

/// Parse `path:line[:col]: message` lines; other non-empty lines become NIT findings.
pub fn parse_lines(check: &str, stdout: &str) -> Vec<Finding> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| parse_line(check, line))
        .collect()
}

fn parse_line(check: &str, line: &str) -> Finding {
    let lower = line.to_ascii_lowercase();
    let severity = if lower.contains("error") || lower.contains("critical") {
        Severity::Critical
    } else if lower.contains("warn") {
        Severity::Warning
    } else {
        Severity::Nit
    };
    let mut parts = line.splitn(4, ':');
    let file = parts.next().unwrap_or_default();
    let line_no = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
    match line_no {
        Some(line_no) if !file.contains(' ') => {
            let rest: Vec<&str> = parts.collect();
            let message = match rest.as_slice() {
                [col, msg] if col.trim().parse::<u32>().is_ok() => msg.trim().to_string(),
                _ => rest.join(":").trim().to_string(),
            };
            Finding::new(check, severity, message).at(file, Some(line_no))
        }
        _ => Finding::new(check, severity, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_json_list_and_wrapped() {
        let list = r#"[{"severity":"critical","message":"sql injection","file":"src/db.rs","line":12}]"#;
        let findings = parse_findings_json("security", list);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].location().as_deref(), Some("src/db.rs:12"));

        let wrapped = r#"{"findings":[{"severity":"nit","message":"naming"}]}"#;
        assert_eq!(parse_findings_json("style", wrapped)[0].severity, Severity::Nit);
    }

    #[test]
    fn truncated_json_still_yields_warning() {
        let findings = parse_tool_output(
            "complexity",
            OutputFormat::FindingsJson,
            r#"[{"severity":"warning","mess"#,
            Some(1),
        );
        assert!(!findings.is_empty());
        assert!(findings.iter().any(|f| f.severity >= Severity::Warning));
    }

    #[test]
    fn nonzero_exit_without_findings_is_not_silent() {
        let findings = parse_tool_output("deps", OutputFormat::Lines, "", Some(2));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert!(parse_tool_output("deps", OutputFormat::Lines, "", Some(0)).is_empty());
    }

    #[test]
    fn cargo_diagnostics_use_primary_span() {
        let stdout = concat!(
            r#"{"reason":"compiler-artifact","target":{}}"#,
            "\n",
            r#"{"reason":"compiler-message","message":{"level":"warning","message":"unused variable: `x`","code":{"code":"unused_variables"},"spans":[{"file_name":"src/lib.rs","line_start":4,"is_primary":true}]}}"#,
            "\n",
            r#"{"reason":"compiler-message","message":{"level":"warning","message":"1 warning emitted","spans":[]}}"#,
            "\n",
            r#"{"reason":"build-finished","success":true}"#,
            "\n"
        );
        let findings = parse_cargo_diagnostics("clippy", stdout);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].message, "unused variable: `x` [unused_variables]");
        assert_eq!(findings[0].line, Some(4));
    }

    #[test]
    fn line_format_extracts_location() {
        let findings = parse_lines("grep", "src/main.rs:10:5: warning: todo left\nsomething odd\n");
        assert_eq!(findings[0].file.as_deref(), Some("src/main.rs"));
        assert_eq!(findings[0].line, Some(10));
        assert_eq!(findings[0].message, "warning: todo left");
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[1].file, None);
        assert_eq!(findings[1].severity, Severity::Nit);
    }

    #[test]
    fn report_aggregates_by_severity() {
        let mut checks = BTreeMap::new();
        checks.insert(
            "a".to_string(),
            NfrCheckReport::from_findings("a", vec![Finding::new("a", Severity::Nit, "n")]),
        );
        checks.insert(
            "b".to_string(),
            NfrCheckReport::errored("b", "b-tool", "tool not found"),
        );
        let report = NfrReport::from_checks(checks);
        assert_eq!(report.aggregate[0].severity, Severity::Warning);
        assert_eq!(report.counts.warning, 1);
        assert_eq!(report.counts.nit, 1);
        assert!(report.has_failures());
        assert_eq!(report.checks["a"].status, NfrCheckStatus::Passed);
    }
}
