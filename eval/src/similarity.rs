//! Scoring a generated diff against a reference patch.
//!
//! Both diffs are split per file on `diff --git` headers. Only files in the
//! reference count, so touching extra files never raises the score.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use similar::TextDiff;

/// A run counts as solved above this similarity.
pub const SUCCESS_THRESHOLD: f64 = 0.3;

static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^diff --git ").expect("valid header regex"));
static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.*) b/").expect("valid file name regex"));

/// Split a unified diff into per-file sections, each starting at its header.
pub fn split_diff_by_files(diff: &str) -> Vec<&str> {
    let mut starts: Vec<usize> = FILE_HEADER.find_iter(diff).map(|m| m.start()).collect();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }
    starts
        .iter()
        .enumerate()
        .map(|(idx, &start)| {
            let end = starts.get(idx + 1).copied().unwrap_or(diff.len());
            diff[start..end].trim()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// File name from the `diff --git a/<name> b/<name>` header; empty if absent.
pub fn diff_file_name(file_diff: &str) -> &str {
    file_diff
        .lines()
        .next()
        .and_then(|line| FILE_NAME.captures(line))
        .and_then(|caps| caps.get(1))
        .map_or("", |m| m.as_str())
}

fn diffs_by_file(diff: &str) -> BTreeMap<&str, &str> {
    split_diff_by_files(diff)
        .into_iter()
        .map(|part| (diff_file_name(part), part))
        .collect()
}

/// Mean per-file similarity over the files of `expected`.
///
/// An empty reference scores 1.0 only against an empty generated diff.
pub fn unified_diff_similarity(expected: &str, generated: &str) -> f64 {
    if expected.trim().is_empty() {
        return if generated.trim().is_empty() { 1.0 } else { 0.0 };
    }
    if generated.trim().is_empty() {
        return 0.0;
    }
    let oracle = diffs_by_file(expected);
    let candidate = diffs_by_file(generated);
    if oracle.is_empty() {
        return 0.0;
    }
    let total: f64 = oracle
        .iter()
        .map(|(name, oracle_diff)| {
            candidate.get(name).map_or(0.0, |candidate_diff| {
                f64::from(TextDiff::from_chars(*oracle_diff, *candidate_diff).ratio())
            })
        })
        .sum();
    total / oracle.len() as f64
}

/// Fraction of reference files that the generated diff touches.
pub fn file_match(expected: &str, generated: &str) -> f64 {
    let oracle: BTreeSet<&str> = diffs_by_file(expected).into_keys().collect();
    let candidate: BTreeSet<&str> = diffs_by_file(generated).into_keys().collect();
    if oracle.is_empty() {
        return if candidate.is_empty() { 1.0 } else { 0.0 };
    }
    oracle.intersection(&candidate).count() as f64 / oracle.len() as f64
}

pub fn is_success(similarity: f64) -> bool {
    similarity > SUCCESS_THRESHOLD
}
