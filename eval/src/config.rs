//! Agent configuration merging.
//!
//! Applies case-specific overrides to the harness-wide agent configuration.

use anyhow::Result;
use nano::io::config::NanoConfig;

use crate::case::CaseConfig;

/// Effective settings for one case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseSettings {
    pub config: NanoConfig,
    pub max_turns: u32,
    pub thinking: bool,
}

/// Apply case configuration overrides to the base agent config.
pub fn apply_case_config(
    base: &NanoConfig,
    thinking: bool,
    overrides: &CaseConfig,
) -> Result<CaseSettings> {
    let mut config = base.clone();
    if let Some(max_turns) = overrides.max_turns {
        config.run.max_turns = max_turns;
    }
    config.validate()?;
    Ok(CaseSettings {
        max_turns: config.run.max_turns,
        thinking: overrides.thinking.unwrap_or(thinking),
        config,
    })
}
