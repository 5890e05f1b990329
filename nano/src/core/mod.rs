//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod command_policy;
pub mod diff;
pub mod invariants;
pub mod ledger;
pub mod matching;
pub mod retry;
pub mod session;
pub mod truncate;
pub mod types;
