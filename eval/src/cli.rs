//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use nano::io::chat::OpenAiChatClient;
use nano::io::config::{NanoConfig, load_config};
use tracing::{debug, info, warn};

use crate::baseline::{
    Baseline, ConfigSnapshot, case_hashes, compare_baselines, git_rev_parse, load_baseline,
    save_baseline,
};
use crate::case::{discover_cases, select_cases};
use crate::metrics::{EvalMetrics, aggregate};
use crate::run::{EvalContext, plan_jobs, run_jobs};
use crate::workspace::remove_workspaces;

/// Options of `eval run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub case_ids: Vec<String>,
    pub runs: u32,
    pub workers: usize,
    pub baseline: Option<String>,
    pub config_path: PathBuf,
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub max_turns: Option<u32>,
    pub thinking: bool,
}

fn cases_dir(repo_root: &Path) -> PathBuf {
    repo_root.join("eval").join("cases")
}

fn baselines_dir(repo_root: &Path) -> PathBuf {
    repo_root.join("eval").join("baselines")
}

/// List all available cases.
pub fn list_cases(repo_root: &Path) -> Result<()> {
    for case in discover_cases(&cases_dir(repo_root))? {
        println!("{}", case.id());
    }
    Ok(())
}

fn load_agent_config(repo_root: &Path, opts: &RunOptions) -> Result<NanoConfig> {
    let path = if opts.config_path.is_absolute() {
        opts.config_path.clone()
    } else {
        repo_root.join(&opts.config_path)
    };
    let mut config = load_config(&path)?;
    if let Some(model) = &opts.model {
        config.model.name = model.clone();
    }
    if let Some(api_base) = &opts.api_base {
        config.model.api_base = api_base.clone();
    }
    if let Some(max_turns) = opts.max_turns {
        config.run.max_turns = max_turns;
    }
    config.validate()?;
    Ok(config)
}

/// Run the selected cases `runs` times each on `workers` threads.
pub fn run_cases(repo_root: &Path, opts: &RunOptions) -> Result<()> {
    if opts.runs == 0 {
        bail!("--runs must be > 0");
    }
    if opts.workers == 0 {
        bail!("--workers must be > 0");
    }
    let config = load_agent_config(repo_root, opts)?;
    let cases = select_cases(discover_cases(&cases_dir(repo_root))?, &opts.case_ids)?;
    if cases.is_empty() {
        bail!("no cases found in {}", cases_dir(repo_root).display());
    }
    if let Some(name) = &opts.baseline
        && baselines_dir(repo_root).join(format!("{name}.json")).exists()
    {
        bail!("baseline {name} already exists");
    }

    let jobs = plan_jobs(&cases, opts.runs);
    info!(cases = cases.len(), jobs = jobs.len(), workers = opts.workers, "starting eval");
    let ctx = EvalContext::new(repo_root, config.clone(), opts.thinking);
    let records = run_jobs(&ctx, jobs, opts.workers, || {
        OpenAiChatClient::from_config(&config.model)
    })?;

    let metrics = aggregate(&records);
    print_metrics(&metrics);

    if let Some(name) = &opts.baseline {
        let git_commit = match git_rev_parse(repo_root) {
            Ok(sha) => Some(sha),
            Err(err) => {
                warn!(err = %err, "cannot read harness git commit");
                None
            }
        };
        let baseline = Baseline {
            name: name.clone(),
            created_at: Utc::now(),
            config: ConfigSnapshot {
                nano_version: env!("CARGO_PKG_VERSION").to_string(),
                git_commit,
                model: config.model.name.clone(),
                api_base: config.model.api_base.clone(),
                temperature: config.model.temperature,
                top_p: config.model.top_p,
                thinking: opts.thinking,
                max_turns: config.run.max_turns,
                runs: opts.runs,
                workers: opts.workers,
                case_hashes: case_hashes(&cases),
            },
            metrics,
            results: records,
        };
        let path = save_baseline(&baselines_dir(repo_root), &baseline)?;
        println!("baseline: {}", path.display());
    }
    Ok(())
}

fn print_metrics(metrics: &EvalMetrics) {
    println!(
        "metrics: cases={} runs={} success_rate={:.3} avg_similarity={:.3} avg_file_match={:.3} avg_tokens={:.1} avg_tools={:.1}",
        metrics.total_cases,
        metrics.total_runs,
        metrics.success_rate,
        metrics.avg_similarity,
        metrics.avg_file_match,
        metrics.avg_tokens,
        metrics.avg_tools
    );
    for (id, stats) in &metrics.per_case {
        println!(
            "case: {} reps={} success_rate={:.2} avg_similarity={:.3}",
            id, stats.repetitions, stats.success_rate, stats.avg_similarity
        );
    }
}

/// Print the differences between two saved baselines.
pub fn compare(repo_root: &Path, first: &str, second: &str, top: usize) -> Result<()> {
    let dir = baselines_dir(repo_root);
    let first = load_baseline(&dir, first).context("load first baseline")?;
    let second = load_baseline(&dir, second).context("load second baseline")?;
    for line in compare_baselines(&first, &second, top) {
        println!("{line}");
    }
    Ok(())
}

/// Remove workspaces and transcripts for a case.
pub fn clean_case(repo_root: &Path, case_id: &str) -> Result<()> {
    let workspaces_dir = repo_root.join("eval").join("workspaces");
    let removed = remove_workspaces(&workspaces_dir, case_id)?;
    debug!(case_id, removed, "workspaces removed");

    let case_results = repo_root.join("eval").join("results").join(case_id);
    if case_results.exists() {
        std::fs::remove_dir_all(&case_results)
            .with_context(|| format!("remove {}", case_results.display()))?;
    }

    println!(
        "clean: case={} workspaces_removed={} results={}",
        case_id,
        removed,
        case_results.display()
    );
    Ok(())
}
