//! Minimal orchestration core for a tool-calling repository-editing agent.
//!
//! A run seeds a conversation with a problem statement and lets the model work
//! on a repository through two tools: a persistent read-only `shell` and an
//! exact-match `apply_patch`. Every message is recorded so runs can be replayed
//! or scored later.
//!
//! - **[`core`]**: Pure, deterministic logic (session state, command policy,
//!   patch matching, diffs, retry schedule). No I/O.
//! - **[`io`]**: Side-effecting adapters (chat endpoint, shell process,
//!   filesystem edits, transcripts, config).
//!
//! [`orchestrator`] drives the turn loop; [`registry`] maps tool calls onto the
//! shell and patch engine.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
