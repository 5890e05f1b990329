//! Aggregation of run records into per-case and overall metrics.
//!
//! Overall averages are taken over cases, not runs, so a case with more
//! repetitions does not weigh more.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::run::RunRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseStats {
    pub repetitions: u32,
    pub success_rate: f64,
    pub avg_similarity: f64,
    pub similarity_std: f64,
    pub avg_file_match: f64,
    pub avg_tokens: f64,
    pub tokens_std: f64,
    pub avg_tools: f64,
    pub tools_std: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub total_cases: usize,
    pub total_runs: usize,
    pub avg_repetitions: f64,
    pub success_rate: f64,
    pub success_std: f64,
    pub avg_similarity: f64,
    pub similarity_std: f64,
    pub avg_file_match: f64,
    pub avg_tokens: f64,
    pub tokens_std: f64,
    pub avg_tools: f64,
    pub tools_std: f64,
    pub per_case: BTreeMap<String, CaseStats>,
}

impl EvalMetrics {
    /// Value of a headline metric by name, with its spread when one exists.
    pub fn headline(&self, name: &str) -> Option<(f64, f64)> {
        match name {
            "success_rate" => Some((self.success_rate, self.success_std)),
            "avg_similarity" => Some((self.avg_similarity, self.similarity_std)),
            "avg_file_match" => Some((self.avg_file_match, 0.0)),
            "avg_tokens" => Some((self.avg_tokens, self.tokens_std)),
            "avg_tools" => Some((self.avg_tools, self.tools_std)),
            _ => None,
        }
    }
}

/// Headline metrics in display order.
pub const HEADLINE_METRICS: [&str; 5] = [
    "success_rate",
    "avg_similarity",
    "avg_file_match",
    "avg_tokens",
    "avg_tools",
];

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0 for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let variance =
        values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn case_stats(records: &[&RunRecord]) -> CaseStats {
    let column = |f: fn(&RunRecord) -> f64| records.iter().map(|r| f(r)).collect::<Vec<f64>>();
    let success = column(|r| if r.success { 1.0 } else { 0.0 });
    let similarity = column(|r| r.similarity);
    let file_match = column(|r| r.file_match);
    let tokens = column(|r| r.tokens as f64);
    let tools = column(|r| f64::from(r.tool_calls));
    CaseStats {
        repetitions: u32::try_from(records.len()).unwrap_or(u32::MAX),
        success_rate: mean(&success),
        avg_similarity: mean(&similarity),
        similarity_std: sample_std(&similarity),
        avg_file_match: mean(&file_match),
        avg_tokens: mean(&tokens),
        tokens_std: sample_std(&tokens),
        avg_tools: mean(&tools),
        tools_std: sample_std(&tools),
    }
}

/// Aggregate records; spreads of the overall metrics are taken across cases.
pub fn aggregate(records: &[RunRecord]) -> EvalMetrics {
    let mut by_case: BTreeMap<&str, Vec<&RunRecord>> = BTreeMap::new();
    for record in records {
        by_case.entry(record.case_id.as_str()).or_default().push(record);
    }
    let per_case: BTreeMap<String, CaseStats> = by_case
        .into_iter()
        .map(|(id, runs)| (id.to_string(), case_stats(&runs)))
        .collect();

    let column = |f: fn(&CaseStats) -> f64| per_case.values().map(f).collect::<Vec<f64>>();
    let success = column(|s| s.success_rate);
    let similarity = column(|s| s.avg_similarity);
    let file_match = column(|s| s.avg_file_match);
    let tokens = column(|s| s.avg_tokens);
    let tools = column(|s| s.avg_tools);
    let repetitions = column(|s| f64::from(s.repetitions));

    EvalMetrics {
        total_cases: per_case.len(),
        total_runs: records.len(),
        avg_repetitions: mean(&repetitions),
        success_rate: mean(&success),
        success_std: sample_std(&success),
        avg_similarity: mean(&similarity),
        similarity_std: sample_std(&similarity),
        avg_file_match: mean(&file_match),
        avg_tokens: mean(&tokens),
        tokens_std: sample_std(&tokens),
        avg_tools: mean(&tools),
        tools_std: sample_std(&tools),
        per_case,
    }
}
