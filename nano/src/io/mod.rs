//! Side-effecting adapters: chat endpoint, shell, filesystem, clock, config.

pub mod chat;
pub mod clock;
pub mod config;
pub mod patch;
pub mod shell;
pub mod transcript;
