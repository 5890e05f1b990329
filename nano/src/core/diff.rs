//! Git-style unified diffs of in-memory file contents.

use similar::TextDiff;

const CONTEXT_LINES: usize = 3;

/// Render a `diff --git` section for one file, or an empty string if unchanged.
pub fn unified_file_diff(path: &str, before: &str, after: &str) -> String {
    if before == after {
        return String::new();
    }
    let diff = TextDiff::from_lines(before, after);
    let body = diff
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    format!("diff --git a/{path} b/{path}\n{body}")
}
