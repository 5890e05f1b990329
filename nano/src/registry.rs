//! Tool registry: the closed set of tools offered to the model.
//!
//! Tool calls arrive as a name plus raw JSON arguments. The registry validates
//! the arguments against the tool's JSON Schema, decodes them into a typed
//! [`ToolInvocation`], runs it on the session's [`ShellSession`] or
//! [`PatchEngine`], and renders the outcome as a [`ToolResult`]. Dispatch never
//! fails: every problem becomes an unsuccessful result the model can read.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::diff::unified_file_diff;
use crate::core::ledger::EditLedger;
use crate::core::types::{ToolCall, ToolResult};
use crate::io::patch::{PatchEngine, PatchError, PatchRequest};
use crate::io::shell::{ShellError, ShellOutput, ShellSession};

/// Names of the tools known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Shell,
    ApplyPatch,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::Shell, ToolKind::ApplyPatch];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Shell => "shell",
            ToolKind::ApplyPatch => "apply_patch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    fn description(self) -> &'static str {
        match self {
            ToolKind::Shell => {
                "Run a read-only shell command inside the repository. The working directory persists between calls."
            }
            ToolKind::ApplyPatch => {
                "Replace the single exact occurrence of `search` with `replace` in one file. Include enough context lines to make `search` unique."
            }
        }
    }

    fn parameters(self) -> Value {
        match self {
            ToolKind::Shell => json!({
                "type": "object",
                "properties": {
                    "cmd": { "type": "string", "description": "Command line to run, e.g. `grep -rn \"def parse\" src`" }
                },
                "required": ["cmd"]
            }),
            ToolKind::ApplyPatch => json!({
                "type": "object",
                "properties": {
                    "file": { "type": "string", "description": "Path relative to the repository root, e.g. src/main.py" },
                    "search": { "type": "string", "description": "Exact text to find, whitespace included" },
                    "replace": { "type": "string", "description": "Text that replaces the match" }
                },
                "required": ["file", "search", "replace"]
            }),
        }
    }

    /// Schema in OpenAI function-tool format.
    pub fn schema(self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

/// Schemas of every tool, in a stable order.
pub fn tool_schemas() -> Vec<Value> {
    ToolKind::ALL.into_iter().map(ToolKind::schema).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShellArgs {
    pub cmd: String,
}

/// A decoded tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocation {
    Shell(ShellArgs),
    ApplyPatch(PatchRequest),
}

impl ToolInvocation {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::Shell(_) => ToolKind::Shell,
            ToolInvocation::ApplyPatch(_) => ToolKind::ApplyPatch,
        }
    }
}

/// Why a tool call could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedCall(pub String);

impl std::fmt::Display for MalformedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result text for a call that could not be decoded or was rejected before dispatch.
pub fn malformed_result(call: &ToolCall, reason: &str) -> ToolResult {
    ToolResult::failed(call.id.clone(), format!("[invalid tool call: {reason}]"))
}

struct ToolValidators {
    shell: Validator,
    apply_patch: Validator,
}

impl ToolValidators {
    fn compile() -> Result<Self> {
        let compile = |kind: ToolKind| {
            jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&kind.parameters())
                .map_err(|e| anyhow!("invalid {} schema: {e}", kind.name()))
        };
        Ok(Self {
            shell: compile(ToolKind::Shell)?,
            apply_patch: compile(ToolKind::ApplyPatch)?,
        })
    }

    fn get(&self, kind: ToolKind) -> &Validator {
        match kind {
            ToolKind::Shell => &self.shell,
            ToolKind::ApplyPatch => &self.apply_patch,
        }
    }
}

/// A dispatched call and the tool it ran; `kind` is `None` for malformed calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub result: ToolResult,
    pub kind: Option<ToolKind>,
}

/// Dispatches tool calls for one session and owns its tool resources.
pub struct ToolRegistry {
    shell: ShellSession,
    patch: PatchEngine,
    ledger: EditLedger,
    shell_timeout: Duration,
    validators: ToolValidators,
}

impl ToolRegistry {
    pub fn new(shell: ShellSession, patch: PatchEngine, shell_timeout: Duration) -> Result<Self> {
        let validators = ToolValidators::compile().context("compile tool schemas")?;
        Ok(Self {
            shell,
            patch,
            ledger: EditLedger::new(),
            shell_timeout,
            validators,
        })
    }

    pub fn schemas(&self) -> Vec<Value> {
        tool_schemas()
    }

    /// Decode a raw call into a typed invocation.
    fn decode(&self, call: &ToolCall) -> Result<ToolInvocation, MalformedCall> {
        let kind = ToolKind::from_name(&call.name).ok_or_else(|| {
            MalformedCall(format!(
                "unknown tool `{}`; available tools: {}",
                call.name,
                ToolKind::ALL.map(ToolKind::name).join(", ")
            ))
        })?;
        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let args: Value = serde_json::from_str(raw)
            .map_err(|e| MalformedCall(format!("arguments are not valid JSON: {e}")))?;
        let errors: Vec<String> = self
            .validators
            .get(kind)
            .iter_errors(&args)
            .map(|err| err.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(MalformedCall(format!(
                "arguments for `{}` do not match its schema: {}",
                kind.name(),
                errors.join("; ")
            )));
        }
        let invocation = match kind {
            ToolKind::Shell => serde_json::from_value(args).map(ToolInvocation::Shell),
            ToolKind::ApplyPatch => serde_json::from_value(args).map(ToolInvocation::ApplyPatch),
        };
        invocation.map_err(|e| MalformedCall(format!("cannot decode arguments: {e}")))
    }

    /// Run one call. Never fails; errors become unsuccessful results.
    #[instrument(skip_all, fields(call_id = %call.id, tool = %call.name))]
    pub fn dispatch(&mut self, call: &ToolCall) -> Dispatched {
        let invocation = match self.decode(call) {
            Ok(invocation) => invocation,
            Err(err) => {
                info!(reason = %err, "malformed tool call");
                return Dispatched {
                    result: malformed_result(call, &err.0),
                    kind: None,
                };
            }
        };
        let result = match &invocation {
            ToolInvocation::Shell(args) => self.run_shell(&call.id, args),
            ToolInvocation::ApplyPatch(request) => self.run_patch(&call.id, request),
        };
        Dispatched {
            result,
            kind: Some(invocation.kind()),
        }
    }

    fn run_shell(&mut self, call_id: &str, args: &ShellArgs) -> ToolResult {
        debug!(cmd = %args.cmd, "running shell tool");
        match self.shell.execute(&args.cmd, self.shell_timeout) {
            Ok(output) => {
                let success = output.success();
                ToolResult {
                    call_id: call_id.to_string(),
                    output: render_shell_output(&output, self.shell_timeout),
                    success,
                }
            }
            Err(ShellError::SandboxViolation(reason)) => {
                ToolResult::failed(call_id, format!("[sandbox violation: {reason}]"))
            }
            Err(ShellError::Exited { partial }) => {
                let mut text = render_shell_output(&partial, self.shell_timeout);
                text.push_str("\n[shell exited unexpectedly; the next command starts a new shell]");
                ToolResult::failed(call_id, text)
            }
            Err(err @ ShellError::Io(_)) => ToolResult::failed(call_id, format!("[{err}]")),
        }
    }

    fn run_patch(&mut self, call_id: &str, request: &PatchRequest) -> ToolResult {
        match self.patch.apply(request) {
            Ok(applied) => {
                self.ledger
                    .record(&applied.file, &applied.before, &applied.after);
                let diff = unified_file_diff(
                    &applied.file,
                    &String::from_utf8_lossy(&applied.before),
                    &String::from_utf8_lossy(&applied.after),
                );
                let mut text = format!("[patch applied to {}]", applied.file);
                if !diff.is_empty() {
                    text.push('\n');
                    text.push_str(&diff);
                }
                ToolResult::ok(call_id, text)
            }
            Err(err) => ToolResult::failed(call_id, render_patch_error(&err)),
        }
    }

    /// Unified diff of every file changed through `apply_patch` so far.
    pub fn final_diff(&self) -> String {
        self.ledger.final_diff()
    }

    pub fn changed_files(&self) -> Vec<&str> {
        self.ledger.changed_files()
    }

    /// Close the shell session.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shell.close()
    }
}

fn render_shell_output(output: &ShellOutput, timeout: Duration) -> String {
    let mut text = String::new();
    if output.timed_out {
        text.push_str(&format!(
            "[command timed out after {}s and was killed]\n",
            timeout.as_secs_f64()
        ));
    } else if let Some(code) = output.exit_code
        && code != 0
    {
        text.push_str(&format!("[command exited with status {code}]\n"));
    }
    text.push_str(&output.stdout);
    if !output.stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(&output.stderr);
    }
    if output.truncated() {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!(
            "[output truncated: {} bytes omitted]",
            output.truncated_bytes
        ));
    }
    if text.is_empty() {
        text.push_str("[command produced no output]");
    }
    text
}

fn render_patch_error(err: &PatchError) -> String {
    match err.hint() {
        Some(hint) => format!("[{err}: {hint}]"),
        None => format!("[{err}]"),
    }
}
