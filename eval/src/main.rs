mod baseline;
mod case;
mod cli;
mod config;
mod metrics;
mod run;
mod similarity;
mod workspace;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "eval", version, about = "Benchmark harness for the nano agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    List,
    Run {
        /// Case ids to run; all cases when omitted.
        case_ids: Vec<String>,
        #[arg(long, default_value_t = 1)]
        runs: u32,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Save results as a named baseline.
        #[arg(long)]
        baseline: Option<String>,
        #[arg(long, default_value = "nano.toml")]
        config: PathBuf,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_base: Option<String>,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        thinking: bool,
    },
    Compare {
        first: String,
        second: String,
        /// Number of cases listed by success-rate change.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    Clean {
        case_id: String,
    },
}

fn main() -> Result<()> {
    nano::logging::init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;
    match cli.command {
        Command::List => cli::list_cases(&repo_root),
        Command::Run {
            case_ids,
            runs,
            workers,
            baseline,
            config,
            model,
            api_base,
            max_turns,
            thinking,
        } => cli::run_cases(
            &repo_root,
            &cli::RunOptions {
                case_ids,
                runs,
                workers,
                baseline,
                config_path: config,
                model,
                api_base,
                max_turns,
                thinking,
            },
        ),
        Command::Compare { first, second, top } => {
            cli::compare(&repo_root, &first, &second, top)
        }
        Command::Clean { case_id } => cli::clean_case(&repo_root, &case_id),
    }
}
