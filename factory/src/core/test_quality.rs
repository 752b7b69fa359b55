//! Static test-quality scan for Rust sources.
//!
//! Flags tests that cannot fail: tautological assertions are CRITICAL, test
//! functions with no assertion at all are WARNING.

use std::sync::LazyLock;

use crate::core::types::{Finding, Severity};

pub const CHECK_NAME: &str = "test_quality";

static ASSERT_TRUE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\bassert!\(\s*true\s*[,)]").unwrap());

static ASSERT_EQ_PAIR: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\bassert_eq!\(\s*([^,()]+?)\s*,\s*([^,()]+?)\s*[,)]").unwrap()
});

static TEST_FN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"#\[(?:tokio::)?test\]\s*((?:#\[[^\]]*\]\s*)*)(?:pub\s+)?(?:async\s+)?fn\s+([A-Za-z0-9_]+)\s*\(\s*\)\s*(->[^{]*)?\{")
        .unwrap()
});

const ASSERTION_MARKERS: [&str; 5] = ["assert", "panic!", "unreachable!", ".expect_err(", "bail!"];

/// Scan one file. `path` is used for finding locations only.
pub fn scan_source(path: &str, contents: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for m in ASSERT_TRUE.find_iter(contents) {
        findings.push(
            Finding::new(CHECK_NAME, Severity::Critical, "tautological assertion `assert!(true)`")
                .at(path, Some(line_of(contents, m.start()))),
        );
    }

    for caps in ASSERT_EQ_PAIR.captures_iter(contents) {
        if caps[1] == caps[2] {
            let start = caps.get(0).map(|m| m.start()).unwrap_or_default();
            findings.push(
                Finding::new(
                    CHECK_NAME,
                    Severity::Critical,
                    format!("tautological assertion: `assert_eq!` compares `{}` with itself", &caps[1]),
                )
                .at(path, Some(line_of(contents, start))),
            );
        }
    }

    for caps in TEST_FN.captures_iter(contents) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let returns_result = caps.get(3).is_some_and(|m| m.as_str().contains("Result"));
        if attrs.contains("should_panic") || returns_result {
            continue;
        }
        let body = fn_body(contents, whole.end());
        if !ASSERTION_MARKERS.iter().any(|m| body.contains(m)) {
            findings.push(
                Finding::new(
                    CHECK_NAME,
                    Severity::Warning,
                    format!("test `{}` has no assertion", &caps[2]),
                )
                .at(path, Some(line_of(contents, whole.start()))),
            );
        }
    }

    findings
}

fn line_of(contents: &str, offset: usize) -> u32 {
    let line = contents[..offset].matches('\n').count() + 1;
    u32::try_from(line).unwrap_or(u32::MAX)
}

/// Text of a function body whose opening brace ends at `open_end`.
fn fn_body(contents: &str, open_end: usize) -> &str {
    let mut depth = 1usize;
    for (idx, ch) in contents[open_end..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &contents[open_end..open_end + idx];
                }
            }
            _ => {}
        }
    }
    &contents[open_end..]
}
