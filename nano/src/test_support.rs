//! Test-only fakes and fixtures for driving full agent runs.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::core::retry::RetryPolicy;
use crate::core::types::{Message, TokenUsage, ToolCall};
use crate::io::chat::{ChatClient, ChatReply, ChatRequest, ModelApiError};
use crate::io::clock::Clock;
use crate::io::config::NanoConfig;

/// What a [`ScriptedChatClient`] answers once its queue is empty.
#[derive(Debug, Clone)]
enum Exhausted {
    Fail,
    /// Keep calling `shell` with this command.
    Shell(String),
}

/// Chat client that replays queued replies and records every request.
#[derive(Debug)]
pub struct ScriptedChatClient {
    replies: Mutex<VecDeque<Result<ChatReply, ModelApiError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    exhausted: Exhausted,
    delay: Duration,
}

impl ScriptedChatClient {
    /// Replay `replies` in order; fail with `InvalidResponse` afterwards.
    pub fn new(replies: Vec<Result<ChatReply, ModelApiError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            exhausted: Exhausted::Fail,
            delay: Duration::ZERO,
        }
    }

    /// Replay successful replies only.
    pub fn replies(replies: Vec<ChatReply>) -> Self {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    /// A model that never stops calling `shell` with `cmd`.
    pub fn always_shell(cmd: &str) -> Self {
        Self {
            exhausted: Exhausted::Shell(cmd.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Sleep for `delay` before answering each request, like a slow endpoint.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Conversations sent so far, one entry per request.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl ChatClient for ScriptedChatClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatReply, ModelApiError> {
        let index = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.push(request.messages.to_vec());
            requests.len()
        };
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some(next) = self.replies.lock().expect("replies lock").pop_front() {
            return next;
        }
        match &self.exhausted {
            Exhausted::Fail => Err(ModelApiError::InvalidResponse(
                "scripted replies exhausted".to_string(),
            )),
            Exhausted::Shell(cmd) => Ok(ChatReply {
                usage: Some(TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                }),
                ..ChatReply::with_tool_calls(vec![shell_call(&format!("call_{index}"), cmd)])
            }),
        }
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(
            Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
                .single()
                .expect("valid time"),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Repository fixture in a temporary directory.
#[derive(Debug)]
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Repository with one file already written.
    pub fn with_file(file: &str, contents: &str) -> Self {
        let repo = Self::new();
        repo.write(file, contents);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, file: &str, contents: &str) {
        let path = self.dir.path().join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn read(&self, file: &str) -> String {
        fs::read_to_string(self.dir.path().join(file)).expect("read fixture file")
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Config for tests: transcripts under `output_dir`, no retry delays and no
/// remaining-turn warnings.
pub fn test_config(output_dir: &Path) -> NanoConfig {
    let mut config = NanoConfig::default();
    config.run.output_dir = PathBuf::from(output_dir);
    config.run.remaining_turns_warning = 0;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
        backoff_factor: 1.0,
    };
    config
}

pub fn shell_call(id: &str, cmd: &str) -> ToolCall {
    ToolCall::new(id, "shell", json!({ "cmd": cmd }).to_string())
}

pub fn patch_call(id: &str, file: &str, search: &str, replace: &str) -> ToolCall {
    ToolCall::new(
        id,
        "apply_patch",
        json!({ "file": file, "search": search, "replace": replace }).to_string(),
    )
}
