//! The agent turn loop.
//!
//! One [`Agent::run_request`] call owns one [`Session`] from seeding to its
//! terminal status:
//!
//! 1. Seed the session with the system prompt and the problem statement.
//! 2. Send the conversation and tool schemas to the chat endpoint, retrying
//!    transient failures.
//! 3. Append the reply. A reply without tool calls ends the run as `done`.
//! 4. Dispatch every tool call in order and append one result per call.
//! 5. Count the turn; reaching `max_turns` ends the run as `truncated`.
//!
//! Every message is appended to the transcript as soon as it joins the
//! session, and the shell is closed before `run_request` returns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::budget::budget_exhausted;
use crate::core::command_policy::CommandPolicy;
use crate::core::session::{Session, SessionId};
use crate::core::truncate::cap_with_notice;
use crate::core::types::{Message, SessionStatus, TokenUsage, ToolCall, ToolResult};
use crate::io::chat::{ChatClient, ChatRequest, complete_with_retry};
use crate::io::clock::{Clock, SystemClock};
use crate::io::config::NanoConfig;
use crate::io::patch::PatchEngine;
use crate::io::shell::{ShellOptions, ShellSession};
use crate::io::transcript::{RunMetadata, ToolCallCounts, TranscriptPaths, TranscriptRecorder};
use crate::prompt::render_system_prompt;
use crate::registry::{ToolKind, ToolRegistry, malformed_result, tool_schemas};

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub problem_statement: String,
    pub repo_root: PathBuf,
    pub max_turns: u32,
    pub thinking: bool,
    /// Appended to the session id, e.g. a benchmark case id.
    pub label: Option<String>,
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Unified diff of every file changed through `apply_patch`.
    pub final_diff: String,
    pub session: Session,
    pub metadata: RunMetadata,
    pub artifacts: TranscriptPaths,
}

impl RunOutcome {
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }
}

/// Counters accumulated over the turn loop.
#[derive(Debug, Default)]
struct LoopStats {
    model_requests: u32,
    tool_calls: ToolCallCounts,
    token_usage: TokenUsage,
    error: Option<String>,
}

/// Drives a tool-calling model against one repository at a time.
pub struct Agent<C: ChatClient> {
    client: C,
    config: NanoConfig,
    clock: Arc<dyn Clock>,
}

impl<C: ChatClient> Agent<C> {
    pub fn new(client: C, config: NanoConfig) -> Self {
        Self {
            client,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for session ids and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &NanoConfig {
        &self.config
    }

    /// Run the agent on `repo_root` until it stops, runs out of turns, or fails.
    pub fn run(
        &self,
        problem_statement: &str,
        repo_root: &Path,
        max_turns: u32,
        thinking: bool,
    ) -> Result<RunOutcome> {
        self.run_request(&RunRequest {
            problem_statement: problem_statement.to_string(),
            repo_root: repo_root.to_path_buf(),
            max_turns,
            thinking,
            label: None,
        })
    }

    /// Run one session.
    ///
    /// Returns `Err` only for setup failures and transcript I/O errors; model
    /// failures end the session with status `error` and are returned as `Ok`.
    #[instrument(skip_all, fields(repo_root = %request.repo_root.display(), max_turns = request.max_turns))]
    pub fn run_request(&self, request: &RunRequest) -> Result<RunOutcome> {
        let started = Instant::now();
        self.config.validate().context("invalid config")?;
        if request.problem_statement.trim().is_empty() {
            bail!("problem statement must be non-empty");
        }
        if request.max_turns == 0 {
            bail!("max_turns must be > 0");
        }
        let repo_root = request
            .repo_root
            .canonicalize()
            .with_context(|| format!("resolve repository root {}", request.repo_root.display()))?;
        if !repo_root.is_dir() {
            bail!("{} is not a directory", repo_root.display());
        }

        let started_at = self.clock.now();
        let session_id = SessionId::new(started_at, request.label.as_deref());
        let tools = tool_schemas();
        let mut recorder =
            TranscriptRecorder::create(&self.config.run.output_dir, &session_id, &tools)?;

        let policy = CommandPolicy::read_only()
            .with_extra_commands(self.config.shell.extra_allowed_commands.iter());
        let shell = ShellSession::spawn(
            &repo_root,
            ShellOptions {
                program: self.config.shell.program.clone(),
                output_limit_bytes: self.config.shell.output_limit_bytes,
                policy,
            },
        )?;
        let patch = PatchEngine::new(&repo_root)
            .with_context(|| format!("open repository {}", repo_root.display()))?;
        let mut registry = ToolRegistry::new(
            shell,
            patch,
            Duration::from_secs(self.config.shell.timeout_secs),
        )?;

        let mut session = Session::new(session_id, repo_root, started_at, request.max_turns);
        info!(session = %session.id(), repo = %session.repo_root().display(), "session started");

        let deadline = self
            .config
            .run
            .max_run_secs
            .map(|secs| started + Duration::from_secs(secs));
        let mut stats = LoopStats::default();
        let ended = self.seed_and_drive(
            request,
            &mut session,
            &mut recorder,
            &mut registry,
            deadline,
            &mut stats,
        );
        if let Err(err) = registry.shutdown() {
            warn!(err = %err, "failed to close shell session");
        }
        let status = ended?;
        session.finish(status)?;

        let final_diff = registry.final_diff();
        let metadata = RunMetadata {
            session_id: session.id().clone(),
            model: self.config.model.name.clone(),
            api_base: self.config.model.api_base.clone(),
            temperature: self.config.model.temperature,
            thinking: request.thinking,
            status,
            turns: session.turn_count(),
            max_turns: session.max_turns(),
            started_at,
            ended_at: self.clock.now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            model_requests: stats.model_requests,
            tool_calls: stats.tool_calls,
            token_usage: stats.token_usage,
            error: stats.error,
            final_diff: final_diff.clone(),
        };
        let artifacts = recorder.record(&session, &metadata)?;
        info!(
            session = %session.id(),
            status = %status,
            turns = session.turn_count(),
            tool_calls = metadata.tool_calls.total(),
            tokens = metadata.token_usage.total(),
            changed_files = registry.changed_files().len(),
            "session finished"
        );

        Ok(RunOutcome {
            final_diff,
            session,
            metadata,
            artifacts,
        })
    }

    fn seed_and_drive(
        &self,
        request: &RunRequest,
        session: &mut Session,
        recorder: &mut TranscriptRecorder,
        registry: &mut ToolRegistry,
        deadline: Option<Instant>,
        stats: &mut LoopStats,
    ) -> Result<SessionStatus> {
        let system = render_system_prompt(&self.config, request.max_turns)?;
        session.push(Message::system(system))?;
        session.push(Message::user(request.problem_statement.clone()))?;
        recorder.sync(session)?;

        let tools = registry.schemas();
        loop {
            if budget_exhausted(deadline) {
                info!(turns = session.turn_count(), "run budget exhausted");
                return Ok(SessionStatus::Truncated);
            }

            stats.model_requests += 1;
            let chat = ChatRequest {
                messages: session.messages(),
                tools: &tools,
                thinking: request.thinking,
            };
            let reply = match complete_with_retry(&self.client, &chat, &self.config.retry) {
                Ok((reply, attempts)) => {
                    stats.model_requests += attempts - 1;
                    reply
                }
                Err(err) => {
                    warn!(err = %err, turns = session.turn_count(), "chat endpoint failed");
                    stats.error = Some(err.to_string());
                    return Ok(SessionStatus::Error);
                }
            };
            if let Some(usage) = reply.usage {
                stats.token_usage.add(usage);
            }

            let calls = with_call_ids(reply.tool_calls, session.turn_count() + 1);
            session.push(Message::assistant(
                reply.content,
                reply.reasoning,
                calls.clone(),
            ))?;
            recorder.sync(session)?;

            if calls.is_empty() {
                session.complete_turn()?;
                return Ok(SessionStatus::Done);
            }

            // Turns left once this one is counted.
            let remaining = session.remaining_turns().saturating_sub(1);
            let mut seen = HashSet::new();
            for call in &calls {
                let mut result = self.dispatch_call(call, &mut seen, registry, stats);
                result.output = cap_with_notice(
                    &result.output,
                    self.config.run.tool_output_limit_bytes,
                    "tool output",
                )
                .text;
                if remaining < self.config.run.remaining_turns_warning {
                    result.output = format!("{}\n{}", turn_warning(remaining), result.output);
                }
                session.push(Message::tool(result))?;
                recorder.sync(session)?;
            }

            let turns = session.complete_turn()?;
            if turns >= session.max_turns() {
                info!(turns, "turn limit reached");
                return Ok(SessionStatus::Truncated);
            }
        }
    }

    fn dispatch_call<'a>(
        &self,
        call: &'a ToolCall,
        seen: &mut HashSet<&'a str>,
        registry: &mut ToolRegistry,
        stats: &mut LoopStats,
    ) -> ToolResult {
        if !seen.insert(call.id.as_str()) {
            stats.tool_calls.invalid += 1;
            return malformed_result(
                call,
                &format!("duplicate tool call id `{}` in one reply", call.id),
            );
        }
        let dispatched = registry.dispatch(call);
        match dispatched.kind {
            Some(ToolKind::Shell) => stats.tool_calls.shell += 1,
            Some(ToolKind::ApplyPatch) => stats.tool_calls.apply_patch += 1,
            None => stats.tool_calls.invalid += 1,
        }
        dispatched.result
    }
}

/// Give calls that arrived without an id a stable one, `call_<turn>_<index>`.
///
/// Tool results must reference a non-empty id on the wire.
fn with_call_ids(mut calls: Vec<ToolCall>, turn: u32) -> Vec<ToolCall> {
    for (index, call) in calls.iter_mut().enumerate() {
        if call.id.trim().is_empty() {
            call.id = format!("call_{turn}_{index}");
        }
    }
    calls
}

fn turn_warning(remaining: u32) -> String {
    format!("[SYSTEM WARNING: Only {remaining} turns remaining. Finish your task soon]")
}
