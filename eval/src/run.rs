//! Case execution orchestration.
//!
//! Coordinates workspace creation, the agent run, and scoring of the final diff.
//! Jobs are spread over worker threads; each worker owns its agent, and each
//! job its own workspace, shell session and transcript directory.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result, anyhow};
use nano::core::types::SessionStatus;
use nano::io::chat::ChatClient;
use nano::io::config::NanoConfig;
use nano::orchestrator::{Agent, RunOutcome, RunRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::case::LoadedCase;
use crate::config::apply_case_config;
use crate::similarity::{file_match, is_success, unified_diff_similarity};
use crate::workspace::create_workspace;

/// Outcome of one (case, repetition) job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub case_id: String,
    pub repetition: u32,
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub success: bool,
    pub similarity: f64,
    pub file_match: f64,
    pub tokens: u64,
    pub tool_calls: u32,
    pub turns: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    fn failed(case_id: &str, repetition: u32, err: &anyhow::Error) -> Self {
        Self {
            case_id: case_id.to_string(),
            repetition,
            session_id: None,
            status: SessionStatus::Error,
            success: false,
            similarity: 0.0,
            file_match: 0.0,
            tokens: 0,
            tool_calls: 0,
            turns: 0,
            duration_ms: 0,
            error: Some(format!("{err:#}")),
        }
    }

    fn scored(case_id: &str, repetition: u32, outcome: &RunOutcome, expected: &str) -> Self {
        let similarity = unified_diff_similarity(expected, &outcome.final_diff);
        let metadata = &outcome.metadata;
        Self {
            case_id: case_id.to_string(),
            repetition,
            session_id: Some(metadata.session_id.to_string()),
            status: metadata.status,
            success: is_success(similarity),
            similarity,
            file_match: file_match(expected, &outcome.final_diff),
            tokens: metadata.token_usage.total(),
            tool_calls: metadata.tool_calls.total(),
            turns: metadata.turns,
            duration_ms: metadata.duration_ms,
            error: metadata.error.clone(),
        }
    }
}

/// One unit of work: a case and its repetition number (1-indexed).
#[derive(Debug, Clone)]
pub struct Job {
    pub case: LoadedCase,
    pub repetition: u32,
}

/// Harness locations and agent settings shared by every job.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub config: NanoConfig,
    pub thinking: bool,
    pub workspaces_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl EvalContext {
    pub fn new(repo_root: &Path, config: NanoConfig, thinking: bool) -> Self {
        let eval_dir = repo_root.join("eval");
        Self {
            config,
            thinking,
            workspaces_dir: eval_dir.join("workspaces"),
            results_dir: eval_dir.join("results"),
        }
    }
}

/// Expand cases into `runs` jobs each, ordered by repetition then case.
pub fn plan_jobs(cases: &[LoadedCase], runs: u32) -> Vec<Job> {
    (1..=runs)
        .flat_map(|repetition| {
            cases.iter().map(move |case| Job {
                case: case.clone(),
                repetition,
            })
        })
        .collect()
}

/// Run one job end-to-end. Failures become an `error` record.
#[instrument(skip_all, fields(case_id = %job.case.id(), repetition = job.repetition))]
pub fn run_job<C: ChatClient>(client: &C, ctx: &EvalContext, job: &Job) -> RunRecord {
    match try_run_job(client, ctx, job) {
        Ok(record) => record,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "job failed before the agent finished");
            RunRecord::failed(job.case.id(), job.repetition, &err)
        }
    }
}

fn try_run_job<C: ChatClient>(client: &C, ctx: &EvalContext, job: &Job) -> Result<RunRecord> {
    let case_id = job.case.id();
    let expected = job.case.expected_patch()?;
    let mut settings = apply_case_config(&ctx.config, ctx.thinking, &job.case.file.config)?;
    settings.config.run.output_dir = ctx.results_dir.join(case_id);

    debug!("creating workspace");
    let workspace = create_workspace(&ctx.workspaces_dir, case_id, &job.case.repo_dir())
        .context("create workspace")?;

    let agent = Agent::new(client, settings.config);
    let outcome = agent.run_request(&RunRequest {
        problem_statement: job.case.file.case.problem_statement.clone(),
        repo_root: workspace.root.clone(),
        max_turns: settings.max_turns,
        thinking: settings.thinking,
        label: Some(format!("{case_id}-r{}", job.repetition)),
    })?;

    let record = RunRecord::scored(case_id, job.repetition, &outcome, &expected);
    write_record(&outcome.artifacts.dir.join("eval.json"), &record)?;
    info!(
        status = %record.status,
        similarity = record.similarity,
        success = record.success,
        "job finished"
    );
    Ok(record)
}

/// Run `jobs` on `workers` threads, each with a client from `make_client`.
///
/// Records come back in job order.
pub fn run_jobs<C, F>(ctx: &EvalContext, jobs: Vec<Job>, workers: usize, make_client: F) -> Result<Vec<RunRecord>>
where
    C: ChatClient,
    F: Fn() -> Result<C> + Sync,
{
    let total = jobs.len();
    let queue = Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>());
    let done = Mutex::new(Vec::with_capacity(total));
    let workers = workers.clamp(1, total.max(1));

    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = &queue;
                let done = &done;
                let make_client = &make_client;
                scope.spawn(move || -> Result<()> {
                    let client = make_client()?;
                    loop {
                        let next = queue
                            .lock()
                            .map_err(|_| anyhow!("job queue poisoned"))?
                            .pop_front();
                        let Some((index, job)) = next else {
                            return Ok(());
                        };
                        debug!(worker, index, case_id = %job.case.id(), "job picked up");
                        let record = run_job(&client, ctx, &job);
                        println!(
                            "run: case={} repetition={} status={} similarity={:.3} success={}",
                            record.case_id,
                            record.repetition,
                            record.status,
                            record.similarity,
                            record.success
                        );
                        done.lock()
                            .map_err(|_| anyhow!("result list poisoned"))?
                            .push((index, record));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow!("eval worker panicked"))??;
        }
        Ok(())
    })?;

    let mut records = done
        .into_inner()
        .map_err(|_| anyhow!("result list poisoned"))?;
    records.sort_by_key(|(index, _)| *index);
    Ok(records.into_iter().map(|(_, record)| record).collect())
}

fn write_record(path: &Path, record: &RunRecord) -> Result<()> {
    let contents = serde_json::to_string_pretty(record).context("serialize run record")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
