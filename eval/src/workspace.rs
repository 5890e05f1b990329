//! Workspace creation and management.
//!
//! Each eval run works on its own copy of the case fixture, committed to a
//! fresh git repository so the agent can inspect history with read-only git.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::debug;

/// An isolated workspace for running a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Absolute path to the workspace root.
    pub root: PathBuf,
    /// Workspace directory name (includes case id, timestamp, and random suffix).
    pub name: String,
}

/// Copy `fixture` into a new workspace under `base_dir`.
pub fn create_workspace(base_dir: &Path, case_id: &str, fixture: &Path) -> Result<Workspace> {
    if !fixture.is_dir() {
        bail!("fixture repository {} is not a directory", fixture.display());
    }
    fs::create_dir_all(base_dir)
        .with_context(|| format!("create workspace dir {}", base_dir.display()))?;

    let name = build_workspace_name(case_id, &generate_timestamp(), &generate_short_id());
    let root = base_dir.join(&name);
    fs::create_dir(&root).with_context(|| format!("create workspace root {}", root.display()))?;
    copy_dir_recursive(fixture, &root)?;

    if !root.join(".git").exists() {
        run_git(&root, &["init", "--quiet"])?;
        run_git(&root, &["config", "user.name", "Nano Eval"])?;
        run_git(&root, &["config", "user.email", "nano-eval@local.invalid"])?;
        run_git(&root, &["add", "."])?;
        run_git(&root, &["commit", "--quiet", "-m", "chore(eval): import fixture"])?;
    }

    let status = run_git(&root, &["status", "--porcelain"])?;
    if !status.trim().is_empty() {
        bail!("workspace has uncommitted changes after bootstrap");
    }
    debug!(workspace = %root.display(), "workspace created");
    Ok(Workspace { root, name })
}

pub fn build_workspace_name(case_id: &str, timestamp: &str, short_id: &str) -> String {
    format!("{case_id}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(anyhow!("missing {}", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

pub(crate) fn run_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("run git {:?}", args))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {:?} failed: {}", args, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Remove every workspace belonging to `case_id`; returns how many were removed.
pub fn remove_workspaces(base_dir: &Path, case_id: &str) -> Result<usize> {
    if !base_dir.exists() {
        return Ok(0);
    }
    let prefix = format!("{case_id}_");
    let mut removed = 0;
    for entry in
        fs::read_dir(base_dir).with_context(|| format!("read {}", base_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) {
            fs::remove_dir_all(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
