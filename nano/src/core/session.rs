//! Append-only conversation state for a single agent run.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Message, SessionStatus};

/// Identifier of one run, derived from its start time.
///
/// Format: `YYYYMMDDTHHMMSS.mmmZ` optionally followed by `-<label>`. The label is
/// reduced to `[A-Za-z0-9_-]` so the id is always a safe directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(started_at: DateTime<Utc>, label: Option<&str>) -> Self {
        let stamp = started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let label: String = label
            .unwrap_or_default()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if label.is_empty() {
            Self(stamp)
        } else {
            Self(format!("{stamp}-{label}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed with status {0}")]
    Closed(SessionStatus),
    #[error("session already used all {0} turns")]
    TurnLimit(u32),
    #[error("cannot move session from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Conversation owned by one orchestrator for one run.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    repo_root: PathBuf,
    started_at: DateTime<Utc>,
    messages: Vec<Message>,
    turn_count: u32,
    max_turns: u32,
    status: SessionStatus,
}

impl Session {
    pub fn new(
        id: SessionId,
        repo_root: PathBuf,
        started_at: DateTime<Utc>,
        max_turns: u32,
    ) -> Self {
        Self {
            id,
            repo_root,
            started_at,
            messages: Vec::new(),
            turn_count: 0,
            max_turns,
            status: SessionStatus::Running,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn remaining_turns(&self) -> u32 {
        self.max_turns.saturating_sub(self.turn_count)
    }

    /// Append a message. Messages cannot be edited or removed once pushed.
    pub fn push(&mut self, message: Message) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Closed(self.status));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Count one completed model turn and return the new total.
    pub fn complete_turn(&mut self) -> Result<u32, SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Closed(self.status));
        }
        if self.turn_count >= self.max_turns {
            return Err(SessionError::TurnLimit(self.max_turns));
        }
        self.turn_count += 1;
        Ok(self.turn_count)
    }

    pub fn finish(&mut self, status: SessionStatus) -> Result<(), SessionError> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        Ok(())
    }
}
