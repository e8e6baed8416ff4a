//! End-to-end execution of one program and its dependencies.
//!
//! Pipeline per program: validate input, check credentials, run dependency
//! waves, run the pre block, drive the attempt state machine (render, budget
//! check, invoke, parse, validate), run the post block, record stats.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::attempt::{AttemptEvent, AttemptMachine, AttemptState};
use crate::core::budget::{ContextBudget, estimate_tokens};
use crate::core::graph::NodeId;
use crate::core::output::{OutputRejection, select_output};
use crate::core::schema::validate;
use crate::core::template;
use crate::core::types::{
    AttemptFailure, AttemptRecord, ExecutionContext, ExecutionResult, RunMetrics, TokenUsage,
    uses_value,
};
use crate::error::{ErrorCode, ErrorPayload, RunError, RunResult};
use crate::io::credentials::{CredentialSource, EnvCredentials, ensure_credentials};
use crate::io::model::{InvokeRequest, ModelBackend};
use crate::io::program::{ProgramCache, ProgramDefinition};
use crate::io::prompt::{
    AttemptPrompt, ContractBlock, DEFAULT_RECOVERY, PromptEngine, append_prompt_log,
};
use crate::io::sandbox::BlockExecutor;
use crate::io::stats::{RunObservation, StatsSink};
use crate::io::worker::BlockStage;
use crate::resolve::{ResolvedGraph, render_bindings, resolve, within_dependency};

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Replaces every program's declared model.
    pub model_override: Option<String>,
    pub model_timeout: Duration,
    pub parallel_dependencies: bool,
    pub prompt_log: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            model_override: None,
            model_timeout: Duration::from_secs(120),
            parallel_dependencies: true,
            prompt_log: None,
        }
    }
}

/// What the stats observation needs from a run, success or not.
#[derive(Debug, Default)]
struct RunTrace {
    input_schema_ok: bool,
    output_schema_ok: bool,
    attempts: u32,
    usage: TokenUsage,
}

pub struct Engine {
    cache: Arc<ProgramCache>,
    model: Arc<dyn ModelBackend>,
    stats: Arc<dyn StatsSink>,
    blocks: Arc<dyn BlockExecutor>,
    credentials: Arc<dyn CredentialSource>,
    prompts: PromptEngine,
}

impl Engine {
    pub fn new(
        cache: Arc<ProgramCache>,
        model: Arc<dyn ModelBackend>,
        stats: Arc<dyn StatsSink>,
        blocks: Arc<dyn BlockExecutor>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            cache,
            model,
            stats,
            blocks,
            credentials,
            prompts: PromptEngine::new(),
        }
    }

    /// Engine that reads provider keys from the process environment.
    pub fn with_env_credentials(
        cache: Arc<ProgramCache>,
        model: Arc<dyn ModelBackend>,
        stats: Arc<dyn StatsSink>,
        blocks: Arc<dyn BlockExecutor>,
    ) -> Self {
        Self::new(cache, model, stats, blocks, Arc::new(EnvCredentials))
    }

    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    /// Run the program at `path` with `input`.
    ///
    /// The whole dependency graph is resolved first, so cycles and missing
    /// children fail before any model call.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn run_path(
        &self,
        path: &Path,
        input: Value,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> RunResult<ExecutionResult> {
        let graph = resolve(&self.cache, path)?;
        self.run_node(&graph, graph.root, input, options, cancel)
    }

    fn run_node(
        &self,
        graph: &ResolvedGraph,
        id: NodeId,
        input: Value,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> RunResult<ExecutionResult> {
        let program = Arc::clone(graph.program(id));
        let model = options
            .model_override
            .clone()
            .unwrap_or_else(|| program.target.model.clone());
        info!(program = %program.name, model = %model, "run started");

        let started = Instant::now();
        let mut trace = RunTrace::default();
        let outcome = self.execute(graph, id, &program, &model, input, options, cancel, &mut trace);
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = outcome.map(|mut result| {
            result.metrics.latency_ms = latency_ms;
            result
        });
        self.record(&program, &model, &outcome, &trace, latency_ms);
        match &outcome {
            Ok(result) => info!(
                program = %program.name,
                attempts = result.attempts.len(),
                latency_ms,
                "run succeeded"
            ),
            Err(err) => info!(program = %program.name, code = %err.code(), latency_ms, "run failed"),
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        graph: &ResolvedGraph,
        id: NodeId,
        program: &ProgramDefinition,
        model: &str,
        input: Value,
        options: &RunOptions,
        cancel: &CancelToken,
        trace: &mut RunTrace,
    ) -> RunResult<ExecutionResult> {
        ensure_live(cancel, "input validation")?;
        if let Err(violation) = validate(&program.input_schema, &input) {
            return Err(ErrorPayload::schema_violation(
                ErrorCode::InputSchemaViolation,
                format!("input does not match input_schema: {violation}"),
                &program.input_schema,
                &input,
                &violation,
            )
            .with_detail("program", program.name.as_str())
            .into());
        }
        trace.input_schema_ok = true;
        ensure_credentials(model, self.credentials.as_ref())?;

        let (outputs, dependencies) = self.run_dependencies(graph, id, &input, options, cancel)?;
        let mut ctx = ExecutionContext::new(input);
        ctx.uses = outputs;

        if let Some(source) = &program.pre_block {
            ensure_live(cancel, "pre block")?;
            let patch = self
                .blocks
                .run(BlockStage::Pre, source, &ctx.block_view(), cancel)?;
            ctx.apply_patch(patch).map_err(|reason| {
                RunError::from(
                    ErrorPayload::new(
                        ErrorCode::BlockExecutionFailure,
                        format!("pre block returned an unusable patch: {reason}"),
                    )
                    .with_detail("stage", BlockStage::Pre.as_str())
                    .with_detail("reason", reason),
                )
            })?;
            debug!(fields = ctx.fields.len(), "pre block applied");
        }

        let (mut output, attempts, metrics) =
            self.attempt_loop(program, model, &mut ctx, options, cancel, trace)?;
        trace.output_schema_ok = true;

        if let Some(source) = &program.post_block {
            ensure_live(cancel, "post block")?;
            let view = json!({
                "input": ctx.input,
                "output": Value::Object(output.clone()),
                "uses": uses_value(&ctx.uses),
            });
            let patch = self.blocks.run(BlockStage::Post, source, &view, cancel)?;
            // Merged as-is: the output contract is not re-checked after this point.
            output.extend(patch);
            debug!("post block merged");
        }

        let retries = attempts.len().saturating_sub(1) as u32;
        Ok(ExecutionResult {
            program: program.name.clone(),
            model: model.to_string(),
            output: Value::Object(output),
            attempts,
            retries,
            dependencies,
            metrics,
        })
    }

    /// Run every dependency of `id`, wave by wave.
    ///
    /// Outputs are keyed by dependency name. When a wave fails, the first
    /// failure in declaration order is returned; a sibling that was only
    /// cancelled because of it is not preferred over the real cause.
    #[instrument(skip_all, fields(program = %graph.program(id).name))]
    fn run_dependencies(
        &self,
        graph: &ResolvedGraph,
        id: NodeId,
        input: &Value,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> RunResult<(BTreeMap<String, Value>, BTreeMap<String, ExecutionResult>)> {
        let program = graph.program(id);
        let mut outputs = BTreeMap::new();
        let mut results = BTreeMap::new();

        for wave in graph.schedule(id) {
            ensure_live(cancel, "dependencies")?;
            let jobs: Vec<(usize, Value)> = wave
                .iter()
                .map(|&index| (index, render_bindings(&program.uses[index], input, &outputs)))
                .collect();
            debug!(size = jobs.len(), "dependency wave");

            let wave_cancel = cancel.child();
            let finished: Vec<RunResult<ExecutionResult>> =
                if options.parallel_dependencies && jobs.len() > 1 {
                    thread::scope(|scope| {
                        let handles: Vec<_> = jobs
                            .into_iter()
                            .map(|(index, child_input)| {
                                let token = wave_cancel.clone();
                                scope.spawn(move || {
                                    let result =
                                        self.run_child(graph, id, index, child_input, options, &token);
                                    if result.is_err() {
                                        token.cancel();
                                    }
                                    result
                                })
                            })
                            .collect();
                        handles
                            .into_iter()
                            .map(|handle| {
                                handle.join().unwrap_or_else(|_| {
                                    Err(RunError::new(
                                        ErrorCode::Unclassified,
                                        "dependency worker panicked",
                                    ))
                                })
                            })
                            .collect()
                    })
                } else {
                    let mut done = Vec::with_capacity(jobs.len());
                    for (index, child_input) in jobs {
                        let result =
                            self.run_child(graph, id, index, child_input, options, &wave_cancel);
                        let failed = result.is_err();
                        done.push(result);
                        if failed {
                            break;
                        }
                    }
                    done
                };

            let mut first_error: Option<RunError> = None;
            for (&index, result) in wave.iter().zip(finished) {
                let name = &program.uses[index].name;
                match result {
                    Ok(child) => {
                        outputs.insert(name.clone(), child.output.clone());
                        results.insert(name.clone(), child);
                    }
                    Err(err) => {
                        let replace = match &first_error {
                            None => true,
                            Some(current) => {
                                current.code() == ErrorCode::Cancelled
                                    && err.code() != ErrorCode::Cancelled
                            }
                        };
                        if replace {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        Ok((outputs, results))
    }

    fn run_child(
        &self,
        graph: &ResolvedGraph,
        parent: NodeId,
        index: usize,
        input: Value,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> RunResult<ExecutionResult> {
        let name = &graph.program(parent).uses[index].name;
        let child = graph.dependency(parent, index);
        self.run_node(graph, child, input, options, cancel)
            .map_err(|err| within_dependency(err, name))
    }

    /// Drive the attempt state machine until success, exhaustion, or a fatal
    /// error.
    fn attempt_loop(
        &self,
        program: &ProgramDefinition,
        model: &str,
        ctx: &mut ExecutionContext,
        options: &RunOptions,
        cancel: &CancelToken,
        trace: &mut RunTrace,
    ) -> RunResult<(Map<String, Value>, Vec<AttemptRecord>, RunMetrics)> {
        let mut machine = AttemptMachine::new(options.max_retries);
        let budget = ContextBudget::new(program.max_context_window);
        let mut records = Vec::new();
        let mut metrics = RunMetrics::default();
        let mut last_rejection: Option<OutputRejection> = None;

        loop {
            ensure_live(cancel, "attempt")?;
            ctx.attempt = machine.attempt();
            let instruction = template::render(&program.instruction, ctx);
            let contract = ContractBlock::from_schema(&program.output_schema);
            let recovery = machine
                .include_recovery()
                .then(|| program.recovery.as_deref().unwrap_or(DEFAULT_RECOVERY));
            let previous = machine.last_failure().map(|failure| failure.reason.as_str());
            let prompt = self
                .prompts
                .render_attempt(&AttemptPrompt {
                    instruction: &instruction,
                    contract: &contract,
                    recovery,
                    previous_failure: previous,
                })
                .map_err(|err| RunError::new(ErrorCode::Unclassified, format!("{err:#}")))?;
            ctx.rendered = prompt;

            let estimated = budget.check(&ctx.rendered, &ctx.input).map_err(|exceeded| {
                RunError::from(
                    ErrorPayload::new(
                        ErrorCode::ContextBudgetExceeded,
                        format!(
                            "estimated {} tokens exceeds max_context_window {}",
                            exceeded.estimated, exceeded.ceiling
                        ),
                    )
                    .with_detail("estimated_tokens", exceeded.estimated)
                    .with_detail("max_context_window", exceeded.ceiling)
                    .with_detail("attempt", machine.attempt()),
                )
            })?;
            metrics.estimated_prompt_tokens = estimated;
            if let Some(log) = &options.prompt_log
                && let Err(err) = append_prompt_log(
                    log,
                    machine.attempt(),
                    machine.max_attempts(),
                    model,
                    &ctx.rendered,
                )
            {
                warn!(err = %format!("{err:#}"), "failed to write prompt log");
            }
            step(&mut machine, AttemptEvent::Rendered)?;

            debug!(attempt = machine.attempt(), estimated, "invoking model");
            let request = InvokeRequest {
                model: model.to_string(),
                prompt: ctx.rendered.clone(),
                params: program.target.params.clone(),
                timeout: options.model_timeout,
            };
            let reply = self
                .model
                .invoke(&request, cancel)
                .map_err(|err| RunError::from(err.to_payload(model)))?;
            trace.attempts = machine.attempt();
            step(&mut machine, AttemptEvent::Invoked)?;

            let usage = match reply.usage {
                Some(usage) => usage,
                None => {
                    metrics.usage_estimated = true;
                    TokenUsage {
                        prompt_tokens: estimated,
                        completion_tokens: estimate_tokens(&reply.text),
                    }
                }
            };
            trace.usage.add(usage);

            match select_output(&reply.text, &program.output_schema) {
                Ok(output) => {
                    step(&mut machine, AttemptEvent::Parsed)?;
                    step(&mut machine, AttemptEvent::Validated)?;
                    records.push(AttemptRecord {
                        attempt: machine.attempt(),
                        prompt: ctx.rendered.clone(),
                        failure: None,
                        usage,
                    });
                    metrics.prompt_tokens = trace.usage.prompt_tokens;
                    metrics.completion_tokens = trace.usage.completion_tokens;
                    metrics.total_tokens = trace.usage.total();
                    return Ok((output, records, metrics));
                }
                Err(rejection) => {
                    if rejection.code == ErrorCode::OutputSchemaViolation {
                        step(&mut machine, AttemptEvent::Parsed)?;
                    }
                    let failure = AttemptFailure {
                        code: rejection.code,
                        reason: rejection.reason.clone(),
                    };
                    records.push(AttemptRecord {
                        attempt: machine.attempt(),
                        prompt: ctx.rendered.clone(),
                        failure: Some(failure.clone()),
                        usage,
                    });
                    warn!(
                        attempt = machine.attempt(),
                        code = %failure.code,
                        reason = %failure.reason,
                        "attempt rejected"
                    );
                    last_rejection = Some(rejection);
                    if step(&mut machine, AttemptEvent::Failed(failure))?.is_terminal() {
                        break;
                    }
                    step(&mut machine, AttemptEvent::Restart)?;
                }
            }
        }

        Err(exhausted(program, &machine, last_rejection))
    }

    fn record(
        &self,
        program: &ProgramDefinition,
        model: &str,
        outcome: &RunResult<ExecutionResult>,
        trace: &RunTrace,
        latency_ms: u64,
    ) {
        let observation = RunObservation {
            program_path: program.path.display().to_string(),
            program: program.name.clone(),
            model: model.to_string(),
            success: outcome.is_ok(),
            error_code: outcome.as_ref().err().map(RunError::code),
            input_schema_ok: trace.input_schema_ok,
            output_schema_ok: trace.output_schema_ok,
            attempts: trace.attempts,
            latency_ms,
            prompt_tokens: trace.usage.prompt_tokens,
            completion_tokens: trace.usage.completion_tokens,
            total_tokens: trace.usage.total(),
        };
        if let Err(err) = self.stats.record(&observation) {
            warn!(program = %program.name, err = %format!("{err:#}"), "failed to record stats");
        }
    }
}

fn step(machine: &mut AttemptMachine, event: AttemptEvent) -> RunResult<AttemptState> {
    machine.advance(event).map_err(|invalid| {
        RunError::new(
            ErrorCode::Unclassified,
            format!(
                "attempt machine rejected {:?} in state {:?}",
                invalid.event, invalid.state
            ),
        )
    })
}

fn ensure_live(cancel: &CancelToken, stage: &str) -> RunResult<()> {
    if cancel.is_cancelled() {
        return Err(ErrorPayload::new(ErrorCode::Cancelled, format!("run cancelled before {stage}"))
            .with_detail("stage", stage)
            .into());
    }
    Ok(())
}

fn exhausted(
    program: &ProgramDefinition,
    machine: &AttemptMachine,
    last: Option<OutputRejection>,
) -> RunError {
    let failures: Vec<Value> = machine
        .failures()
        .iter()
        .enumerate()
        .map(|(i, failure)| {
            json!({
                "attempt": i + 1,
                "error_code": failure.code,
                "reason": failure.reason,
            })
        })
        .collect();
    let last_code = machine
        .last_failure()
        .map_or(ErrorCode::Unclassified, |failure| failure.code);
    let last_reason = machine
        .last_failure()
        .map(|failure| failure.reason.clone())
        .unwrap_or_default();

    let mut payload = ErrorPayload::new(
        ErrorCode::RetryExhausted,
        format!(
            "output contract not satisfied after {} attempt(s): {last_reason}",
            machine.attempt()
        ),
    )
    .with_detail("last_error_code", last_code.as_str())
    .with_detail("attempts", machine.attempt())
    .with_detail("failures", failures)
    .with_detail("program", program.name.as_str())
    .with_expected(program.output_schema.clone());
    if let Some(rejection) = last {
        if let Some(violation) = &rejection.violation {
            payload = payload
                .with_detail("path", violation.path.as_str())
                .with_detail("validator", violation.keyword);
        }
        payload = payload.with_received(rejection.received);
    }
    payload.into()
}
