//! Run transcripts under `<output_dir>/<session_id>/`.
//!
//! - `tools.json`: tool schemas offered to the model, written once at start
//! - `messages.jsonl`: one JSON object per message, appended as the run progresses
//! - `metadata.json`: run summary, written once at the end
//!
//! Files are created with create-new semantics; an existing session directory
//! is an error so a transcript is never overwritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::invariants::validate_transcript;
use crate::core::session::{Session, SessionId};
use crate::core::types::{Message, SessionStatus, TokenUsage};

/// Number of tool calls per tool in one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCallCounts {
    pub shell: u32,
    pub apply_patch: u32,
    /// Calls rejected before dispatch (unknown tool, bad arguments, duplicate id).
    pub invalid: u32,
}

impl ToolCallCounts {
    pub fn total(&self) -> u32 {
        self.shell + self.apply_patch + self.invalid
    }
}

/// Summary written to `metadata.json` when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub session_id: SessionId,
    pub model: String,
    pub api_base: String,
    pub temperature: f64,
    pub thinking: bool,
    pub status: SessionStatus,
    pub turns: u32,
    pub max_turns: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub model_requests: u32,
    pub tool_calls: ToolCallCounts,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub final_diff: String,
}

#[derive(Debug, Clone)]
pub struct TranscriptPaths {
    pub dir: PathBuf,
    pub messages_path: PathBuf,
    pub tools_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl TranscriptPaths {
    pub fn new(output_dir: &Path, session_id: &SessionId) -> Self {
        let dir = output_dir.join(session_id.as_str());
        Self {
            messages_path: dir.join("messages.jsonl"),
            tools_path: dir.join("tools.json"),
            metadata_path: dir.join("metadata.json"),
            dir,
        }
    }
}

/// Append-only writer for one session's artifacts.
#[derive(Debug)]
pub struct TranscriptRecorder {
    paths: TranscriptPaths,
    messages: File,
    written: usize,
}

impl TranscriptRecorder {
    /// Create the session directory and write `tools.json`.
    pub fn create(output_dir: &Path, session_id: &SessionId, tools: &[Value]) -> Result<Self> {
        let paths = TranscriptPaths::new(output_dir, session_id);
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        fs::create_dir(&paths.dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                anyhow!("transcript directory {} already exists", paths.dir.display())
            } else {
                anyhow!("create transcript dir {}: {e}", paths.dir.display())
            }
        })?;
        write_json_new(&paths.tools_path, tools)?;
        let messages = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&paths.messages_path)
            .with_context(|| format!("create {}", paths.messages_path.display()))?;
        debug!(dir = %paths.dir.display(), "transcript created");
        Ok(Self {
            paths,
            messages,
            written: 0,
        })
    }

    pub fn paths(&self) -> &TranscriptPaths {
        &self.paths
    }

    /// Append one message as a JSON line.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let mut line = serde_json::to_string(message).context("serialize message")?;
        line.push('\n');
        self.messages
            .write_all(line.as_bytes())
            .and_then(|()| self.messages.flush())
            .with_context(|| format!("append {}", self.paths.messages_path.display()))?;
        self.written += 1;
        Ok(())
    }

    /// Append every session message not yet written.
    pub fn sync(&mut self, session: &Session) -> Result<()> {
        let pending = session.messages().get(self.written..).unwrap_or_default();
        for message in pending {
            self.append(message)?;
        }
        Ok(())
    }

    /// Flush remaining messages and write `metadata.json`; consumes the recorder.
    pub fn record(mut self, session: &Session, metadata: &RunMetadata) -> Result<TranscriptPaths> {
        self.sync(session)?;
        let errors = validate_transcript(session.messages());
        if !errors.is_empty() {
            warn!(errors = ?errors, "transcript has structural errors");
        }
        self.messages
            .sync_all()
            .with_context(|| format!("sync {}", self.paths.messages_path.display()))?;
        write_json_new(&self.paths.metadata_path, metadata)?;
        Ok(self.paths)
    }
}

fn write_json_new<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}

/// Read back `messages.jsonl`.
pub fn load_messages(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut messages = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        messages.push(message);
    }
    Ok(messages)
}

/// Read back `metadata.json`.
pub fn load_metadata(path: &Path) -> Result<RunMetadata> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
