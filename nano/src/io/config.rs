//! Agent configuration stored in `nano.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Default config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "nano.toml";

/// Agent configuration (TOML).
///
/// Every field has a default so a partial (or missing) file is valid. CLI flags
/// override individual fields for a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NanoConfig {
    pub model: ModelConfig,
    pub run: RunConfig,
    pub shell: ShellConfig,
    pub retry: RetryPolicy,
}

/// Chat endpoint and sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model id sent with every request and recorded in run metadata.
    pub name: String,

    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub api_base: String,

    /// Environment variable holding the bearer token; unset means no auth header.
    pub api_key_env: Option<String>,

    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "Qwen/Qwen3-8B".to_string(),
            api_base: "http://localhost:8000/v1".to_string(),
            api_key_env: None,
            temperature: 0.7,
            top_p: 0.8,
            max_tokens: 4096,
            request_timeout_secs: 600,
        }
    }
}

/// Limits of a single agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_turns: u32,

    /// Wall-clock budget for the whole run; unset means turns are the only limit.
    pub max_run_secs: Option<u64>,

    /// Directory receiving one transcript directory per session.
    pub output_dir: PathBuf,

    /// Cap on the text of any single tool result sent back to the model.
    pub tool_output_limit_bytes: usize,

    /// Tool results carry a warning once fewer than this many turns remain.
    pub remaining_turns_warning: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_run_secs: None,
            output_dir: PathBuf::from(".nano"),
            tool_output_limit_bytes: 8_000,
            remaining_turns_warning: 5,
        }
    }
}

/// Restricted shell settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Bash-compatible shell binary.
    pub program: String,

    pub timeout_secs: u64,

    /// Per-stream cap on captured command output.
    pub output_limit_bytes: usize,

    /// Programs allowed in addition to the built-in read-only set.
    pub extra_allowed_commands: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            timeout_secs: 4,
            output_limit_bytes: 2_000,
            extra_allowed_commands: Vec::new(),
        }
    }
}

impl NanoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model.name must be non-empty"));
        }
        if !(self.model.api_base.starts_with("http://") || self.model.api_base.starts_with("https://")) {
            return Err(anyhow!("model.api_base must be an http(s) URL"));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(anyhow!("model.temperature must be within [0, 2]"));
        }
        if !(self.model.top_p > 0.0 && self.model.top_p <= 1.0) {
            return Err(anyhow!("model.top_p must be within (0, 1]"));
        }
        if self.model.max_tokens == 0 {
            return Err(anyhow!("model.max_tokens must be > 0"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.run.max_turns == 0 {
            return Err(anyhow!("run.max_turns must be > 0"));
        }
        if self.run.max_run_secs == Some(0) {
            return Err(anyhow!("run.max_run_secs must be > 0 when set"));
        }
        if self.run.tool_output_limit_bytes == 0 {
            return Err(anyhow!("run.tool_output_limit_bytes must be > 0"));
        }
        if self.run.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("run.output_dir must be non-empty"));
        }
        if self.shell.program.trim().is_empty() {
            return Err(anyhow!("shell.program must be non-empty"));
        }
        if self.shell.timeout_secs == 0 {
            return Err(anyhow!("shell.timeout_secs must be > 0"));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        if let Some(bad) = self
            .shell
            .extra_allowed_commands
            .iter()
            .find(|c| c.trim().is_empty() || c.contains(char::is_whitespace) || c.contains('/'))
        {
            return Err(anyhow!(
                "shell.extra_allowed_commands entries must be bare program names, got {bad:?}"
            ));
        }
        self.retry.validate()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `NanoConfig::default()`.
pub fn load_config(path: &Path) -> Result<NanoConfig> {
    if !path.exists() {
        let cfg = NanoConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: NanoConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &NanoConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
