//! `nano`: run a tool-calling model as a repository-editing agent.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use nano::core::types::SessionStatus;
use nano::exit_codes;
use nano::io::chat::OpenAiChatClient;
use nano::io::config::{DEFAULT_CONFIG_FILE, NanoConfig, load_config, write_config};
use nano::logging;
use nano::orchestrator::{Agent, RunRequest};
use nano::registry::tool_schemas;

#[derive(Parser)]
#[command(
    name = "nano",
    version,
    about = "Minimal tool-calling agent that edits a repository"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Solve one problem in a repository and print the resulting diff.
    Run(RunArgs),
    /// Print the tool schemas offered to the model.
    Tools,
    /// Write a config file with every default spelled out.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Repository the agent works in.
    #[arg(long)]
    repo: PathBuf,

    /// Problem statement text.
    #[arg(long, conflicts_with = "problem_file", required_unless_present = "problem_file")]
    problem: Option<String>,

    /// File containing the problem statement.
    #[arg(long)]
    problem_file: Option<PathBuf>,

    /// Override `run.max_turns`.
    #[arg(long)]
    max_turns: Option<u32>,

    /// Ask the model to emit reasoning before answering.
    #[arg(long)]
    thinking: bool,

    /// Override `model.name`.
    #[arg(long)]
    model: Option<String>,

    /// Override `model.api_base`.
    #[arg(long)]
    api_base: Option<String>,

    /// Override `run.output_dir`.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Tools => {
            let schemas = serde_json::to_string_pretty(&tool_schemas())?;
            println!("{schemas}");
            Ok(exit_codes::DONE)
        }
        Command::InitConfig { path, force } => {
            cmd_init_config(&path, force)?;
            Ok(exit_codes::DONE)
        }
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let mut config = load_config(&args.config)?;
    if let Some(model) = args.model {
        config.model.name = model;
    }
    if let Some(api_base) = args.api_base {
        config.model.api_base = api_base;
    }
    if let Some(output_dir) = args.output_dir {
        config.run.output_dir = output_dir;
    }
    let max_turns = args.max_turns.unwrap_or(config.run.max_turns);
    config.validate()?;

    let problem_statement = match (args.problem, args.problem_file) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("read problem file {}", path.display()))?,
        (None, None) => bail!("either --problem or --problem-file is required"),
    };

    let client = OpenAiChatClient::from_config(&config.model)?;
    let agent = Agent::new(client, config);
    let outcome = agent.run_request(&RunRequest {
        problem_statement,
        repo_root: args.repo,
        max_turns,
        thinking: args.thinking,
        label: None,
    })?;

    print!("{}", outcome.final_diff);
    eprintln!(
        "session {} finished: {} after {} turns (transcript: {})",
        outcome.session.id(),
        outcome.status(),
        outcome.session.turn_count(),
        outcome.artifacts.dir.display()
    );
    if let Some(error) = &outcome.metadata.error {
        eprintln!("model error: {error}");
    }
    Ok(exit_code(outcome.status()))
}

fn exit_code(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Done => exit_codes::DONE,
        SessionStatus::Truncated => exit_codes::TRUNCATED,
        SessionStatus::Error => exit_codes::MODEL_ERROR,
        SessionStatus::Running => exit_codes::INVALID,
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &NanoConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}
