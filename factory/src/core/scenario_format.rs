//! Parser for markdown scenario definitions.
//!
//! ````text
//! # Scenario: cli prints version
//! ## Category
//! cli
//! ## Preconditions
//! - binary is built
//! ## Behavioral Expectation
//! `app --version` prints the crate version.
//! ## Evaluation Method
//! ```bash
//! ./target/debug/app --version | grep -q 0.1
//! ```
//! ## Pass Criteria
//! Exit code 0.
//! ## Evidence Required
//! - stdout of the command
//! ## Side Effects
//! none
//! ````
//!
//! Every section except `Side Effects` is mandatory. A document missing one is
//! rejected with [`ScenarioFormatError`] naming the section.

use std::path::Path;
use std::sync::LazyLock;

use crate::core::scenario::{Scenario, ScenarioCategory};
use crate::error::ScenarioFormatError;

pub const SECTION_CATEGORY: &str = "Category";
pub const SECTION_PRECONDITIONS: &str = "Preconditions";
pub const SECTION_EXPECTATION: &str = "Behavioral Expectation";
pub const SECTION_EVALUATION: &str = "Evaluation Method";
pub const SECTION_PASS_CRITERIA: &str = "Pass Criteria";
pub const SECTION_EVIDENCE: &str = "Evidence Required";
pub const SECTION_SIDE_EFFECTS: &str = "Side Effects";

static FENCED_BLOCK: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n(.*?)```").unwrap());

/// Parse one scenario document. `source` is the path recorded on the scenario.
pub fn parse_scenario(source: &Path, content: &str) -> Result<Scenario, ScenarioFormatError> {
    let sections = split_sections(content);
    let missing = |section: &'static str| ScenarioFormatError {
        file: source.to_path_buf(),
        section,
    };
    let required = |section: &'static str| -> Result<&str, ScenarioFormatError> {
        sections
            .iter()
            .find(|(heading, _)| heading.eq_ignore_ascii_case(section))
            .map(|(_, body)| body.as_str())
            .ok_or_else(|| missing(section))
    };

    let category = required(SECTION_CATEGORY)?.trim();
    if category.is_empty() {
        return Err(missing(SECTION_CATEGORY));
    }
    let preconditions = required(SECTION_PRECONDITIONS)?.trim().to_string();
    let behavioral_expectation = required(SECTION_EXPECTATION)?.trim().to_string();
    let evaluation_command = extract_command(required(SECTION_EVALUATION)?);
    if evaluation_command.is_empty() {
        return Err(missing(SECTION_EVALUATION));
    }
    let pass_criteria = required(SECTION_PASS_CRITERIA)?.trim().to_string();
    if pass_criteria.is_empty() {
        return Err(missing(SECTION_PASS_CRITERIA));
    }
    let evidence_required = list_items(required(SECTION_EVIDENCE)?);

    let side_effect_free = sections
        .iter()
        .find(|(heading, _)| heading.eq_ignore_ascii_case(SECTION_SIDE_EFFECTS))
        .is_some_and(|(_, body)| body.trim().eq_ignore_ascii_case("none"));

    let name = scenario_name(content).unwrap_or_else(|| {
        source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    Ok(Scenario {
        name,
        category: ScenarioCategory::parse(category),
        preconditions,
        behavioral_expectation,
        evaluation_command,
        pass_criteria,
        evidence_required,
        side_effect_free,
        source: source.to_string_lossy().replace('\\', "/"),
    })
}

fn scenario_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("# ")?;
        let name = rest.trim().strip_prefix("Scenario:")?.trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Split on `## ` headings. Lines inside fenced code blocks never start a section.
fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut in_fence = false;
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence
            && let Some(heading) = trimmed.strip_prefix("## ")
        {
            sections.push((heading.trim().to_string(), String::new()));
            continue;
        }
        if let Some((_, body)) = sections.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    sections
}

/// Prefer the first fenced code block; fall back to the raw section text.
fn extract_command(body: &str) -> String {
    match FENCED_BLOCK.captures(body) {
        Some(caps) => caps[1].trim().to_string(),
        None => body.trim().to_string(),
    }
}

fn list_items(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let item = line.trim().strip_prefix('-')?.trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}
