//! Ordered rule table mapping failure text to a likely root cause.
//!
//! Rules are evaluated top to bottom and the first match wins. Text no rule
//! matches lands in [`RootCauseCategory::Uncategorized`], so every failure is
//! accounted for.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Category of a failure. Declaration order is the feedback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseCategory {
    MissingDependency,
    MissingArtifact,
    Timeout,
    Assertion,
    Uncategorized,
}

impl RootCauseCategory {
    pub fn explanation(self) -> &'static str {
        match self {
            RootCauseCategory::MissingDependency => {
                "Likely a missing module, crate or command, or a wrong import path."
            }
            RootCauseCategory::MissingArtifact => {
                "Expected files or build artifacts are not being produced."
            }
            RootCauseCategory::Timeout => "Possible infinite loop, deadlock or slow computation.",
            RootCauseCategory::Assertion => "Behavior differs from what was expected; read the assertion messages.",
            RootCauseCategory::Uncategorized => "No clear pattern; review the failure details.",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RootCauseCategory::MissingDependency => "Missing dependency",
            RootCauseCategory::MissingArtifact => "Missing artifact",
            RootCauseCategory::Timeout => "Timeout",
            RootCauseCategory::Assertion => "Assertion failure",
            RootCauseCategory::Uncategorized => "Uncategorized",
        }
    }
}

/// One row of the rule table.
pub struct RootCauseRule {
    pub category: RootCauseCategory,
    pub pattern: regex::Regex,
}

static DEFAULT_RULES: LazyLock<Vec<RootCauseRule>> = LazyLock::new(|| {
    let rule = |category, pattern: &str| RootCauseRule {
        category,
        pattern: regex::Regex::new(pattern).unwrap(),
    };
    vec![
        rule(
            RootCauseCategory::MissingDependency,
            r"ModuleNotFoundError|ImportError|unresolved import|can't find crate|cannot find crate|command not found|not installed",
        ),
        rule(
            RootCauseCategory::MissingArtifact,
            r"FileNotFoundError|No such file or directory|No such file|does not exist",
        ),
        rule(
            RootCauseCategory::Timeout,
            r"(?i)timed out|timeout after|\bTIMEOUT\b",
        ),
        rule(
            RootCauseCategory::Assertion,
            r"AssertionError|assertion failed|assertion `left == right` failed|panicked at|expected .* (got|found)",
        ),
    ]
});

/// The built-in rule table.
pub fn default_rules() -> &'static [RootCauseRule] {
    &DEFAULT_RULES
}

/// Classify failure text with `rules`, defaulting to `Uncategorized`.
pub fn classify(rules: &[RootCauseRule], text: &str) -> RootCauseCategory {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(text))
        .map(|rule| rule.category)
        .unwrap_or(RootCauseCategory::Uncategorized)
}

/// A category with the failures attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCause {
    pub category: RootCauseCategory,
    pub explanation: String,
    /// Names of the failing scenarios or gates, in input order.
    pub affected: Vec<String>,
}

/// Group `(name, failure text)` pairs by category, in priority order.
pub fn infer_root_causes<'a>(
    rules: &[RootCauseRule],
    failures: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<RootCause> {
    let mut grouped: BTreeMap<RootCauseCategory, Vec<String>> = BTreeMap::new();
    for (name, text) in failures {
        grouped
            .entry(classify(rules, text))
            .or_default()
            .push(name.to_string());
    }
    grouped
        .into_iter()
        .map(|(category, affected)| RootCause {
            category,
            explanation: category.explanation().to_string(),
            affected,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let rules = default_rules();
        let text = "ModuleNotFoundError: no module named x\nAssertionError";
        assert_eq!(classify(rules, text), RootCauseCategory::MissingDependency);
        assert_eq!(
            classify(rules, "thread 'main' panicked at src/lib.rs:3"),
            RootCauseCategory::Assertion
        );
        assert_eq!(
            classify(rules, "cat: out.json: No such file or directory"),
            RootCauseCategory::MissingArtifact
        );
        assert_eq!(classify(rules, "Timeout after 5s"), RootCauseCategory::Timeout);
    }

    #[test]
    fn unmatched_text_is_uncategorized() {
        assert_eq!(
            classify(default_rules(), "exit status 3"),
            RootCauseCategory::Uncategorized
        );
        assert_eq!(classify(default_rules(), ""), RootCauseCategory::Uncategorized);
    }

    #[test]
    fn grouping_follows_priority_order() {
        let causes = infer_root_causes(
            default_rules(),
            [
                ("c", "assertion failed: x == y"),
                ("a", "bash: foo: command not found"),
                ("b", "weird"),
                ("d", "AssertionError"),
            ],
        );
        let categories: Vec<RootCauseCategory> = causes.iter().map(|c| c.category).collect();
        assert_eq!(
            categories,
            vec![
                RootCauseCategory::MissingDependency,
                RootCauseCategory::Assertion,
                RootCauseCategory::Uncategorized,
            ]
        );
        assert_eq!(causes[1].affected, vec!["c", "d"]);
    }

    #[test]
    fn custom_rules_extend_the_table() {
        let rules = vec![RootCauseRule {
            category: RootCauseCategory::MissingArtifact,
            pattern: regex::Regex::new("no checkpoint").expect("regex"),
        }];
        assert_eq!(
            classify(&rules, "error: no checkpoint saved"),
            RootCauseCategory::MissingArtifact
        );
    }
}
