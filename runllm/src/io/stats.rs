//! Run statistics: one observation per completed program run.
//!
//! The engine only writes through [`StatsSink`]. [`JsonlStatsStore`] keeps an
//! append-only JSON-lines file and answers aggregate queries for the CLI.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// One finished run of one program, as seen by the stats collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunObservation {
    pub program_path: String,
    pub program: String,
    pub model: String,
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub input_schema_ok: bool,
    pub output_schema_ok: bool,
    pub attempts: u32,
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Receives observations. Implementations must tolerate concurrent callers.
pub trait StatsSink: Send + Sync {
    fn record(&self, observation: &RunObservation) -> Result<()>;
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn record(&self, _observation: &RunObservation) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRun {
    recorded_at: String,
    #[serde(flatten)]
    run: RunObservation,
}

/// Append-only JSON-lines store.
#[derive(Debug)]
pub struct JsonlStatsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable observation; malformed lines are skipped.
    pub fn observations(&self) -> Result<Vec<RunObservation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read stats {}", self.path.display()))?;
        let mut out = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRun>(line) {
                Ok(stored) => out.push(stored.run),
                Err(err) => warn!(line = index + 1, err = %err, "skipping malformed stats line"),
            }
        }
        Ok(out)
    }

    /// Aggregate observations for one program, optionally for one model.
    pub fn aggregate(&self, program_path: &str, model: Option<&str>) -> Result<StatsSummary> {
        let runs: Vec<RunObservation> = self
            .observations()?
            .into_iter()
            .filter(|run| run.program_path == program_path)
            .filter(|run| model.is_none_or(|model| run.model == model))
            .collect();
        Ok(StatsSummary::from_runs(program_path, model, &runs))
    }
}

impl StatsSink for JsonlStatsStore {
    fn record(&self, observation: &RunObservation) -> Result<()> {
        let stored = StoredRun {
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run: observation.clone(),
        };
        let mut line = serde_json::to_string(&stored).context("serialize observation")?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create stats dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open stats {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append stats {}", self.path.display()))?;
        debug!(program = %observation.program, success = observation.success, "recorded run");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub program_path: String,
    pub model: Option<String>,
    pub total_runs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub output_schema_compliance_pct: f64,
    pub input_schema_compliance_pct: f64,
    pub avg_latency_ms: f64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub max_completion_tokens: u64,
    pub total_tokens: u64,
    pub ms_per_1k_tokens: f64,
}

impl StatsSummary {
    pub fn from_runs(program_path: &str, model: Option<&str>, runs: &[RunObservation]) -> Self {
        let total = runs.len() as u64;
        let mean = |f: &dyn Fn(&RunObservation) -> f64| {
            if runs.is_empty() {
                0.0
            } else {
                runs.iter().map(f).sum::<f64>() / runs.len() as f64
            }
        };
        let pct = |f: &dyn Fn(&RunObservation) -> bool| {
            mean(&|run| if f(run) { 100.0 } else { 0.0 })
        };
        let token_runs: Vec<f64> = runs
            .iter()
            .filter(|run| run.total_tokens > 0)
            .map(|run| run.latency_ms as f64 / run.total_tokens as f64 * 1000.0)
            .collect();
        let success_count = runs.iter().filter(|run| run.success).count() as u64;

        Self {
            program_path: program_path.to_string(),
            model: model.map(str::to_string),
            total_runs: total,
            success_count,
            failure_count: total - success_count,
            success_rate: if total == 0 {
                0.0
            } else {
                success_count as f64 / total as f64
            },
            output_schema_compliance_pct: pct(&|run| run.output_schema_ok),
            input_schema_compliance_pct: pct(&|run| run.input_schema_ok),
            avg_latency_ms: mean(&|run| run.latency_ms as f64),
            avg_prompt_tokens: mean(&|run| run.prompt_tokens as f64),
            avg_completion_tokens: mean(&|run| run.completion_tokens as f64),
            max_completion_tokens: runs
                .iter()
                .map(|run| run.completion_tokens)
                .max()
                .unwrap_or(0),
            total_tokens: runs
                .iter()
                .fold(0u64, |acc, run| acc.saturating_add(run.total_tokens)),
            ms_per_1k_tokens: if token_runs.is_empty() {
                0.0
            } else {
                token_runs.iter().sum::<f64>() / token_runs.len() as f64
            },
        }
    }
}

/// Expected wall time for a program: its own average plus its direct
/// dependencies' averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyEstimate {
    pub program_path: String,
    pub model: Option<String>,
    pub estimated_ms: f64,
    pub root_avg_latency_ms: f64,
    pub deps_avg_latency_ms: f64,
    pub dependency_count: usize,
}

pub fn estimate_latency_ms(
    store: &JsonlStatsStore,
    program_path: &str,
    dependency_paths: &[String],
    model: Option<&str>,
) -> Result<LatencyEstimate> {
    let root = store.aggregate(program_path, model)?.avg_latency_ms;
    let mut deps = 0.0;
    for path in dependency_paths {
        deps += store.aggregate(path, model)?.avg_latency_ms;
    }
    Ok(LatencyEstimate {
        program_path: program_path.to_string(),
        model: model.map(str::to_string),
        estimated_ms: root + deps,
        root_avg_latency_ms: root,
        deps_avg_latency_ms: deps,
        dependency_count: dependency_paths.len(),
    })
}
