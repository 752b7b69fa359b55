//! Disable and re-enable build-file targets that reference the holdout.
//!
//! A target block is the `name:` rule line plus every following recipe or
//! continuation line, up to the next blank or unindented line. Disabling wraps
//! the block in marker comments and prefixes each line with `# `; enabling
//! strips exactly what disabling added, so `enable(disable(x)) == x`.
//! Both operations are idempotent.

pub const MARKER: &str = "[factory:holdout-stripped]";

fn begin_line(target: &str) -> String {
    format!("# {MARKER} disabled target {target}")
}

fn end_line() -> String {
    format!("# end {MARKER}")
}

/// Result of a toggle pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggle {
    pub contents: String,
    /// Targets whose state changed in this pass.
    pub changed: Vec<String>,
}

/// Comment out every listed target that is currently enabled.
pub fn disable_targets(contents: &str, targets: &[String]) -> Toggle {
    let (lines, trailing_newline) = split_lines(contents);
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut changed = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(target) = defined_target(line, targets) {
            let end = block_end(&lines, i);
            out.push(begin_line(target));
            for block_line in &lines[i..end] {
                out.push(format!("# {block_line}"));
            }
            out.push(end_line());
            changed.push(target.to_string());
            i = end;
            continue;
        }
        out.push(line.to_string());
        i += 1;
    }
    Toggle {
        contents: join_lines(&out, trailing_newline),
        changed,
    }
}

/// Restore every listed target previously disabled by [`disable_targets`].
pub fn enable_targets(contents: &str, targets: &[String]) -> Toggle {
    let (lines, trailing_newline) = split_lines(contents);
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut changed = Vec::new();
    let end_marker = end_line();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let disabled = targets.iter().find(|t| line == begin_line(t));
        let close = disabled.and_then(|_| {
            lines[i + 1..]
                .iter()
                .position(|l| *l == end_marker)
                .map(|offset| i + 1 + offset)
        });
        if let (Some(target), Some(close)) = (disabled, close) {
            for block_line in &lines[i + 1..close] {
                let restored = block_line
                    .strip_prefix("# ")
                    .or_else(|| block_line.strip_prefix('#'))
                    .unwrap_or(block_line);
                out.push(restored.to_string());
            }
            changed.push(target.clone());
            i = close + 1;
            continue;
        }
        out.push(line.to_string());
        i += 1;
    }
    Toggle {
        contents: join_lines(&out, trailing_newline),
        changed,
    }
}

/// Targets from `targets` that are defined and not disabled.
pub fn enabled_targets(contents: &str, targets: &[String]) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| defined_target(line, targets))
        .map(str::to_string)
        .collect()
}

/// Returns the target name if `line` is a rule definition for one of `targets`.
///
/// `name:` and `name::` are rules; `name :=` and `name ?=` are assignments.
fn defined_target<'a>(line: &str, targets: &'a [String]) -> Option<&'a str> {
    if line.starts_with(char::is_whitespace) || line.starts_with('#') {
        return None;
    }
    let (head, rest) = line.split_once(':')?;
    if rest.starts_with('=') {
        return None;
    }
    let head = head.trim();
    if head.contains('=') {
        return None;
    }
    targets
        .iter()
        .find(|t| head.split_whitespace().any(|name| name == t.as_str()))
        .map(String::as_str)
}

fn block_end(lines: &[&str], start: usize) -> usize {
    let mut end = start + 1;
    let mut continued = lines[start].ends_with('\\');
    while end < lines.len() {
        let line = lines[end];
        let recipe = line.starts_with('\t') || line.starts_with(' ');
        if !(recipe || continued) || line.trim().is_empty() {
            break;
        }
        continued = line.ends_with('\\');
        end += 1;
    }
    end
}

fn split_lines(contents: &str) -> (Vec<&str>, bool) {
    let trailing_newline = contents.ends_with('\n');
    let body = contents.strip_suffix('\n').unwrap_or(contents);
    if body.is_empty() && !trailing_newline {
        return (Vec::new(), false);
    }
    (body.split('\n').collect(), trailing_newline)
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAKEFILE: &str = "SCENARIOS := scenarios\n\nbuild:\n\tcargo build\n\nrun-scenarios: build\n\tfactory run-scenarios \\\n\t  --timeout 60\n\ncompile-feedback:\n\tfactory iterate\n\ntest:\n\tcargo test\n";

    fn targets() -> Vec<String> {
        vec!["run-scenarios".to_string(), "compile-feedback".to_string()]
    }

    #[test]
    fn disable_comments_out_target_blocks() {
        let toggle = disable_targets(MAKEFILE, &targets());
        assert_eq!(toggle.changed, targets());
        assert!(toggle
            .contents
            .contains("# [factory:holdout-stripped] disabled target run-scenarios\n# run-scenarios: build\n# \tfactory run-scenarios \\\n# \t  --timeout 60\n# end [factory:holdout-stripped]\n"));
        assert!(toggle.contents.contains("build:\n\tcargo build\n"));
        assert!(toggle.contents.contains("test:\n\tcargo test\n"));
        assert!(enabled_targets(&toggle.contents, &targets()).is_empty());
    }

    #[test]
    fn enable_restores_exact_bytes() {
        let disabled = disable_targets(MAKEFILE, &targets());
        let enabled = enable_targets(&disabled.contents, &targets());
        assert_eq!(enabled.contents, MAKEFILE);
        assert_eq!(enabled.changed, targets());
    }

    #[test]
    fn toggles_are_idempotent() {
        let once = disable_targets(MAKEFILE, &targets());
        let twice = disable_targets(&once.contents, &targets());
        assert_eq!(once.contents, twice.contents);
        assert!(twice.changed.is_empty());

        let again = enable_targets(MAKEFILE, &targets());
        assert_eq!(again.contents, MAKEFILE);
        assert!(again.changed.is_empty());
    }

    #[test]
    fn assignments_are_not_targets() {
        let contents = "run-scenarios := yes\nrun-scenarios ?= no\n";
        let toggle = disable_targets(contents, &targets());
        assert_eq!(toggle.contents, contents);
        assert!(toggle.changed.is_empty());
    }

    #[test]
    fn file_without_trailing_newline_round_trips() {
        let contents = "run-scenarios:\n\techo hi";
        let disabled = disable_targets(contents, &targets());
        assert!(!disabled.contents.ends_with('\n'));
        assert_eq!(enable_targets(&disabled.contents, &targets()).contents, contents);
    }
}
