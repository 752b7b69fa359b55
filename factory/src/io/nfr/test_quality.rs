//! Built-in check running the test-quality scan over the project's Rust files.

use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use walkdir::{DirEntry, WalkDir};

use crate::core::nfr::NfrCheckReport;
use crate::core::test_quality::{CHECK_NAME, scan_source};
use crate::core::types::{Finding, Severity};
use crate::io::nfr::NfrCheck;

const SKIP_DIRS: [&str; 4] = ["target", ".git", ".factory", "node_modules"];

pub struct TestQualityCheck;

impl NfrCheck for TestQualityCheck {
    fn name(&self) -> &str {
        CHECK_NAME
    }

    fn tool(&self) -> &str {
        "factory"
    }

    fn run(&self, root: &Path) -> Result<NfrCheckReport> {
        let mut findings = Vec::new();
        let mut scanned = 0usize;
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !skipped(e));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "rs") {
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(path);
            if !in_source_tree(rel) {
                continue;
            }
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            scanned += 1;
            match fs::read_to_string(path) {
                Ok(contents) => findings.extend(scan_source(&rel_str, &contents)),
                Err(err) => findings.push(
                    Finding::new(CHECK_NAME, Severity::Warning, format!("could not read file: {err}"))
                        .at(rel_str, None),
                ),
            }
        }
        if scanned == 0 {
            return Ok(NfrCheckReport::skipped(
                self.tool(),
                "no Rust sources under src/ or tests/",
            ));
        }
        Ok(NfrCheckReport::from_findings(self.tool(), findings))
    }
}

fn skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && SKIP_DIRS
            .iter()
            .any(|skip| entry.file_name().to_string_lossy() == *skip)
}

/// Under some `src/` or `tests/` directory.
fn in_source_tree(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(name) => name == "src" || name == "tests",
        _ => false,
    })
}
