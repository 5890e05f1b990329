//! Stable exit codes for the `nano` CLI.

/// The run finished with the model stopping on its own.
pub const DONE: i32 = 0;
/// Invalid arguments, config, repository path or other setup errors.
pub const INVALID: i32 = 1;
/// The run hit its turn limit or wall-clock budget.
pub const TRUNCATED: i32 = 2;
/// The chat endpoint failed after exhausting retries.
pub const MODEL_ERROR: i32 = 3;
