//! Test-only collaborators and program fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::types::TokenUsage;
use crate::error::{ErrorCode, ErrorPayload, RunResult};
use crate::io::model::{InvokeError, InvokeRequest, ModelBackend, ModelReply};
use crate::io::sandbox::BlockExecutor;
use crate::io::stats::{RunObservation, StatsSink};
use crate::io::worker::{BlockStage, WorkerRequest, evaluate_block};

type Scripted = Result<ModelReply, InvokeError>;

/// Model backend that replays canned responses.
///
/// Prompt rules are checked first (first rule whose needle appears in the
/// prompt wins), then the queue, then the fallback.
#[derive(Default)]
pub struct ScriptedModel {
    rules: Vec<(String, String)>,
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    usage: Option<TokenUsage>,
    delay: Option<Duration>,
    requests: Mutex<Vec<InvokeRequest>>,
}

impl ScriptedModel {
    /// Replies with each text in order, then fails.
    pub fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            queue: Mutex::new(replies.into_iter().map(|text| Ok(reply(text))).collect()),
            ..Self::default()
        }
    }

    /// Replies with `text` on every call.
    pub fn always(text: &str) -> Self {
        Self {
            fallback: Some(Ok(reply(text))),
            ..Self::default()
        }
    }

    /// Fails every call with `err`.
    pub fn failing(err: InvokeError) -> Self {
        Self {
            fallback: Some(Err(err)),
            ..Self::default()
        }
    }

    /// Replies by prompt content: `(needle, reply)` pairs.
    pub fn matching<'a>(rules: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(needle, text)| (needle.to_string(), text.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    /// Report `usage` with every text reply.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Wait `delay` (or until cancelled) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.model).collect()
    }

    pub fn requests(&self) -> Vec<InvokeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next(&self, prompt: &str) -> Scripted {
        if let Some((_, text)) = self.rules.iter().find(|(needle, _)| prompt.contains(needle)) {
            return Ok(reply(text));
        }
        let queued = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        queued
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(InvokeError::Failed("script exhausted".to_string())))
    }
}

fn reply(text: &str) -> ModelReply {
    ModelReply {
        text: text.to_string(),
        usage: None,
    }
}

impl ModelBackend for ScriptedModel {
    fn invoke(&self, request: &InvokeRequest, cancel: &CancelToken) -> Result<ModelReply, InvokeError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(delay) = self.delay {
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    return Err(InvokeError::Cancelled);
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        self.next(&request.prompt).map(|mut reply| {
            if reply.usage.is_none() {
                reply.usage = self.usage;
            }
            reply
        })
    }
}

/// Stats sink that keeps observations in memory.
#[derive(Debug, Default)]
pub struct RecordingStats {
    observations: Mutex<Vec<RunObservation>>,
    fail: bool,
}

impl RecordingStats {
    /// Records nothing and errors on every write.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn observations(&self) -> Vec<RunObservation> {
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatsSink for RecordingStats {
    fn record(&self, observation: &RunObservation) -> Result<()> {
        if self.fail {
            return Err(anyhow!("stats store unavailable"));
        }
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observation.clone());
        Ok(())
    }
}

/// Evaluates blocks on the calling thread. No process isolation or limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessBlocks {
    pub trusted: bool,
}

impl BlockExecutor for InProcessBlocks {
    fn run(
        &self,
        stage: BlockStage,
        source: &str,
        context: &Value,
        cancel: &CancelToken,
    ) -> RunResult<Map<String, Value>> {
        if cancel.is_cancelled() {
            return Err(ErrorPayload::new(ErrorCode::Cancelled, "run cancelled during block").into());
        }
        let request = WorkerRequest {
            stage,
            source: source.to_string(),
            context: context.clone(),
            trusted: self.trusted,
        };
        evaluate_block(&request).map_err(|reason| {
            ErrorPayload::new(
                ErrorCode::BlockExecutionFailure,
                format!("{} block failed: {reason}", stage.as_str()),
            )
            .with_detail("stage", stage.as_str())
            .with_detail("reason", reason)
            .with_detail("trusted", self.trusted)
            .into()
        })
    }
}

/// Temp directory holding `.rllm` files.
pub struct ProgramFixture {
    dir: TempDir,
}

impl Default for ProgramFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Write `source` to `name` (relative to the fixture dir) and return its path.
    pub fn write(&self, name: &str, source: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, source).expect("write fixture");
        path
    }
}

/// A complete program: `{text: string}` in, `{summary: string}` out.
pub fn fixture_source(name: &str, body: &str) -> String {
    format!(
        "---\n\
         name: {name}\n\
         description: Test program {name}.\n\
         version: 0.1.0\n\
         author: tests\n\
         max_context_window: 8000\n\
         input_schema: {{type: object, properties: {{text: {{type: string}}}}, required: [text], additionalProperties: false}}\n\
         output_schema: {{type: object, properties: {{summary: {{type: string}}}}, required: [summary], additionalProperties: false}}\n\
         llm: {{model: openai/gpt-4o-mini}}\n\
         llm_params: {{}}\n\
         ---\n\
         {body}"
    )
}

/// Add a `uses` list to a program's header. Each entry is
/// `(name, path, with)` where `with` is a YAML flow mapping.
pub fn with_uses(source: &str, deps: &[(&str, &str, &str)]) -> String {
    let mut block = String::from("\nuses:\n");
    for (name, path, with) in deps {
        block.push_str(&format!(
            "  - name: {name}\n    path: {path}\n    with: {with}\n"
        ));
    }
    block.push_str("---\n");
    source.replacen("\n---\n", &block, 1)
}
