//! System prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::io::config::NanoConfig;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Render the system message for a run limited to `max_turns`.
pub fn render_system_prompt(config: &NanoConfig, max_turns: u32) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .context("parse system prompt template")?;
    let template = env.get_template("system")?;
    let rendered = template
        .render(context! {
            max_turns => max_turns,
            shell_timeout_secs => config.shell.timeout_secs,
            output_limit_bytes => config.shell.output_limit_bytes,
            extra_commands => &config.shell.extra_allowed_commands,
        })
        .context("render system prompt")?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_limits() {
        let prompt = render_system_prompt(&NanoConfig::default(), 7).expect("render");
        assert!(prompt.contains("at most 7 turns"));
        assert!(prompt.contains("after 4s"));
        assert!(prompt.contains("`apply_patch`"));
        assert!(!prompt.contains("Additional programs"));
    }

    #[test]
    fn extra_commands_are_listed() {
        let mut config = NanoConfig::default();
        config.shell.extra_allowed_commands = vec!["pytest".to_string(), "make".to_string()];
        let prompt = render_system_prompt(&config, 3).expect("render");
        assert!(prompt.contains("Additional programs available in `shell`: pytest, make."));
    }
}
