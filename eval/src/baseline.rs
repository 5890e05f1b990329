//! Versioned baselines: saved eval results and their comparison.
//!
//! A baseline is written once to `eval/baselines/<name>.json`; saving over an
//! existing name is an error.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::case::LoadedCase;
use crate::metrics::{EvalMetrics, HEADLINE_METRICS};
use crate::run::RunRecord;

/// Settings that produced a baseline, for reproducibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub nano_version: String,
    /// Git commit of the harness checkout.
    pub git_commit: Option<String>,
    pub model: String,
    pub api_base: String,
    pub temperature: f64,
    pub top_p: f64,
    pub thinking: bool,
    pub max_turns: u32,
    pub runs: u32,
    pub workers: usize,
    /// SHA-256 of each case file, keyed by case id.
    pub case_hashes: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    /// Changed settings as `(name, before, after)`.
    pub fn changes(&self, after: &ConfigSnapshot) -> Vec<(&'static str, String, String)> {
        let short = |commit: &Option<String>| {
            commit
                .as_deref()
                .map_or_else(|| "unknown".to_string(), |c| c.chars().take(8).collect())
        };
        let fields = [
            ("nano_version", self.nano_version.clone(), after.nano_version.clone()),
            ("git_commit", short(&self.git_commit), short(&after.git_commit)),
            ("model", self.model.clone(), after.model.clone()),
            ("api_base", self.api_base.clone(), after.api_base.clone()),
            ("temperature", self.temperature.to_string(), after.temperature.to_string()),
            ("top_p", self.top_p.to_string(), after.top_p.to_string()),
            ("thinking", self.thinking.to_string(), after.thinking.to_string()),
            ("max_turns", self.max_turns.to_string(), after.max_turns.to_string()),
            ("runs", self.runs.to_string(), after.runs.to_string()),
            ("workers", self.workers.to_string(), after.workers.to_string()),
        ];
        let mut changes: Vec<_> = fields
            .into_iter()
            .filter(|(_, before, now)| before != now)
            .collect();
        let changed_cases = self
            .case_hashes
            .iter()
            .filter(|(id, hash)| after.case_hashes.get(*id).is_some_and(|h| h != *hash))
            .count();
        if changed_cases > 0 {
            changes.push(("case_files", "-".to_string(), format!("{changed_cases} changed")));
        }
        changes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub config: ConfigSnapshot,
    pub metrics: EvalMetrics,
    pub results: Vec<RunRecord>,
}

pub fn baseline_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// Write a new baseline; fails if one with the same name exists.
pub fn save_baseline(dir: &Path, baseline: &Baseline) -> Result<PathBuf> {
    validate_name(&baseline.name)?;
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = baseline_path(dir, &baseline.name);
    let mut payload = serde_json::to_string_pretty(baseline).context("serialize baseline")?;
    payload.push('\n');
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                anyhow!("baseline {} already exists at {}", baseline.name, path.display())
            } else {
                anyhow!("create {}: {e}", path.display())
            }
        })?;
    file.write_all(payload.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), "baseline saved");
    Ok(path)
}

pub fn load_baseline(dir: &Path, name: &str) -> Result<Baseline> {
    let path = baseline_path(dir, name);
    if !path.exists() {
        bail!("baseline {name} not found at {}", path.display());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("baseline name must be non-empty");
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        || name.starts_with('.')
    {
        bail!("baseline name must use [A-Za-z0-9._-] and not start with '.'");
    }
    Ok(())
}

/// Human-readable comparison of two baselines, one line per entry.
pub fn compare_baselines(first: &Baseline, second: &Baseline, top: usize) -> Vec<String> {
    let mut lines = vec![
        format!(
            "first:  {} ({} cases, {:.1} avg reps)",
            first.name, first.metrics.total_cases, first.metrics.avg_repetitions
        ),
        format!(
            "second: {} ({} cases, {:.1} avg reps)",
            second.name, second.metrics.total_cases, second.metrics.avg_repetitions
        ),
    ];

    let changes = first.config.changes(&second.config);
    if !changes.is_empty() {
        lines.push("config changes:".to_string());
        for (name, before, after) in changes {
            lines.push(format!("  {name:12}: {before} -> {after}"));
        }
    }

    lines.push("metrics:".to_string());
    for name in HEADLINE_METRICS {
        let (Some((before, before_std)), Some((after, after_std))) =
            (first.metrics.headline(name), second.metrics.headline(name))
        else {
            continue;
        };
        lines.push(format!(
            "  {name:15}: {} -> {} ({:+.3})",
            with_spread(before, before_std),
            with_spread(after, after_std),
            after - before
        ));
    }

    let mut deltas: Vec<(&String, f64, f64)> = first
        .metrics
        .per_case
        .iter()
        .filter_map(|(id, before)| {
            second
                .metrics
                .per_case
                .get(id)
                .map(|after| (id, before.success_rate, after.success_rate))
        })
        .collect();
    if !deltas.is_empty() {
        deltas.sort_by(|a, b| (b.2 - b.1).abs().total_cmp(&(a.2 - a.1).abs()).then(a.0.cmp(b.0)));
        lines.push("largest success-rate changes:".to_string());
        for (id, before, after) in deltas.into_iter().take(top) {
            lines.push(format!("  {id}: {before:.2} -> {after:.2} ({:+.2})", after - before));
        }
    }
    lines
}

fn with_spread(value: f64, std: f64) -> String {
    if std > 0.0 {
        format!("{value:.3}±{std:.3}")
    } else {
        format!("{value:.3}")
    }
}

pub fn case_hashes(cases: &[LoadedCase]) -> BTreeMap<String, String> {
    cases
        .iter()
        .filter_map(|case| match file_sha256(&case.path) {
            Ok(hash) => Some((case.id().to_string(), hash)),
            Err(err) => {
                warn!(case_id = %case.id(), err = %err, "cannot hash case file");
                None
            }
        })
        .collect()
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

pub fn git_rev_parse(repo_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_root)
        .output()
        .context("git rev-parse")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git rev-parse failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
