//! Host side of the block sandbox.
//!
//! Each block runs in a fresh worker process (by default this binary's hidden
//! `block-worker` subcommand). The host owns every limit: it kills the worker
//! on timeout, on a resident-set breach, or when the run is cancelled, and
//! discards whatever the worker produced.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{ErrorCode, ErrorPayload, RunError, RunResult};
use crate::io::process::{Limits, Termination, run_supervised};
use crate::io::worker::{BlockStage, WorkerReply, WorkerRequest};

/// Restrictions applied to every block run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Relaxes capability restrictions; the timeout still applies.
    pub trusted: bool,
    pub timeout: Duration,
    /// Resident-set ceiling for untrusted workers; 0 disables it.
    pub memory_limit_mb: u64,
    pub output_limit_bytes: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            trusted: false,
            timeout: Duration::from_secs(2),
            memory_limit_mb: 256,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Runs transform blocks and returns their patch.
pub trait BlockExecutor: Send + Sync {
    fn run(
        &self,
        stage: BlockStage,
        source: &str,
        context: &Value,
        cancel: &CancelToken,
    ) -> RunResult<Map<String, Value>>;
}

/// Command line that starts a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running executable with the hidden `block-worker` subcommand.
    pub fn current_exe() -> RunResult<Self> {
        let program = std::env::current_exe().map_err(|err| {
            RunError::from(
                ErrorPayload::new(
                    ErrorCode::BlockExecutionFailure,
                    "cannot locate the worker executable",
                )
                .with_detail("reason", err.to_string()),
            )
        })?;
        Ok(Self::binary(program))
    }

    /// A `runllm` binary at `program`.
    pub fn binary(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["block-worker".to_string()],
        }
    }
}

/// Process-isolated block runner.
#[derive(Debug, Clone)]
pub struct BlockRunner {
    worker: WorkerCommand,
    policy: SandboxPolicy,
}

impl BlockRunner {
    pub fn new(worker: WorkerCommand, policy: SandboxPolicy) -> Self {
        Self { worker, policy }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    fn limits(&self) -> Limits {
        let memory_limit_bytes = (!self.policy.trusted && self.policy.memory_limit_mb > 0)
            .then(|| self.policy.memory_limit_mb.saturating_mul(1024 * 1024));
        Limits {
            timeout: self.policy.timeout,
            memory_limit_bytes,
            output_limit_bytes: self.policy.output_limit_bytes,
        }
    }
}

impl BlockExecutor for BlockRunner {
    #[instrument(skip_all, fields(stage = stage.as_str(), trusted = self.policy.trusted))]
    fn run(
        &self,
        stage: BlockStage,
        source: &str,
        context: &Value,
        cancel: &CancelToken,
    ) -> RunResult<Map<String, Value>> {
        let failure = |reason: String| -> RunError {
            ErrorPayload::new(
                ErrorCode::BlockExecutionFailure,
                format!("{} block failed: {reason}", stage.as_str()),
            )
            .with_detail("stage", stage.as_str())
            .with_detail("reason", reason)
            .with_detail("trusted", self.policy.trusted)
            .into()
        };

        let request = WorkerRequest {
            stage,
            source: source.to_string(),
            context: context.clone(),
            trusted: self.policy.trusted,
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| failure(format!("serialize request: {e}")))?;

        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args);
        if !self.policy.trusted {
            cmd.env_clear().current_dir(std::env::temp_dir());
        }

        let output = run_supervised(cmd, Some(&payload), &self.limits(), cancel)
            .map_err(|e| failure(format!("{e:#}")))?;

        match output.termination {
            Termination::Exited => {}
            Termination::TimedOut => {
                warn!(timeout_ms = self.policy.timeout.as_millis() as u64, "block timed out");
                return Err(failure(format!(
                    "timed out after {} ms",
                    self.policy.timeout.as_millis()
                )));
            }
            Termination::MemoryExceeded { resident_bytes } => {
                warn!(resident_bytes, "block exceeded memory limit");
                return Err(failure(format!(
                    "exceeded memory limit of {} MB",
                    self.policy.memory_limit_mb
                )));
            }
            Termination::Cancelled => {
                return Err(ErrorPayload::new(ErrorCode::Cancelled, "run cancelled during block")
                    .with_detail("stage", stage.as_str())
                    .into());
            }
        }

        let reply: WorkerReply = serde_json::from_slice(&output.stdout).map_err(|e| {
            failure(format!(
                "malformed worker reply ({e}); exit {:?}: {}",
                output.status.code(),
                output.stderr_text()
            ))
        })?;
        if !reply.ok {
            return Err(failure(
                reply.error.unwrap_or_else(|| "unknown worker error".to_string()),
            ));
        }
        match reply.result {
            None | Some(Value::Null) => {
                debug!("block returned no patch");
                Ok(Map::new())
            }
            Some(Value::Object(patch)) => {
                debug!(keys = patch.len(), "block returned patch");
                Ok(patch)
            }
            Some(other) => Err(failure(format!("block result is not an object: {other}"))),
        }
    }
}
