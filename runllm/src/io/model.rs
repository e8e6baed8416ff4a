//! Model invocation boundary.
//!
//! The engine hands a rendered prompt to a [`ModelBackend`] and expects text
//! plus optional usage counts back. [`CommandModel`] talks to an external bridge
//! process over JSON on stdin/stdout; tests use scripted backends instead.

use std::io::ErrorKind;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::TokenUsage;
use crate::error::{ErrorCode, ErrorPayload};
use crate::io::process::{Limits, Termination, run_supervised};

/// Parameters for one model call.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model: String,
    pub prompt: String,
    pub params: Map<String, Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub text: String,
    /// `None` when the backend did not report usage.
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvokeError {
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error("model artifact unavailable: {0}")]
    MissingArtifact(String),
    #[error("model call failed: {0}")]
    Failed(String),
    #[error("model call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("model call cancelled")]
    Cancelled,
}

impl InvokeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InvokeError::Shape(_) => ErrorCode::InvocationShapeError,
            InvokeError::MissingArtifact(_) => ErrorCode::MissingModelArtifact,
            InvokeError::Failed(_) | InvokeError::TimedOut(_) => ErrorCode::InvocationFailure,
            InvokeError::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn to_payload(&self, model: &str) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string()).with_detail("model", model)
    }
}

/// Abstraction over model invocation backends.
pub trait ModelBackend: Send + Sync {
    /// Send one prompt. Implementations must give up once `request.timeout`
    /// elapses or `cancel` fires.
    fn invoke(&self, request: &InvokeRequest, cancel: &CancelToken)
    -> Result<ModelReply, InvokeError>;
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    params: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    text: Option<Value>,
    usage: Option<BridgeUsage>,
    error: Option<BridgeError>,
}

#[derive(Debug, Deserialize)]
struct BridgeUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct BridgeError {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Backend that spawns a bridge command per call.
///
/// The bridge reads `{"model","prompt","params"}` on stdin and writes either
/// `{"text": "...", "usage": {...}}` or `{"error": {"kind", "message"}}` on
/// stdout. An error kind of `missing-model` marks an unavailable model.
#[derive(Debug, Clone)]
pub struct CommandModel {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandModel {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl ModelBackend for CommandModel {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancelToken,
    ) -> Result<ModelReply, InvokeError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| InvokeError::Failed("backend command is empty".to_string()))?;
        let payload = serde_json::to_vec(&BridgeRequest {
            model: &request.model,
            prompt: &request.prompt,
            params: &request.params,
        })
        .map_err(|err| InvokeError::Failed(format!("serialize request: {err}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let limits = Limits {
            timeout: request.timeout,
            memory_limit_bytes: None,
            output_limit_bytes: self.output_limit_bytes,
        };
        let output = run_supervised(cmd, Some(&payload), &limits, cancel).map_err(|err| {
            let not_found = err
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == ErrorKind::NotFound);
            if not_found {
                InvokeError::MissingArtifact(format!("backend command '{program}' not found"))
            } else {
                InvokeError::Failed(format!("{err:#}"))
            }
        })?;

        match output.termination {
            Termination::Exited => {}
            Termination::Cancelled => return Err(InvokeError::Cancelled),
            Termination::TimedOut | Termination::MemoryExceeded { .. } => {
                return Err(InvokeError::TimedOut(request.timeout));
            }
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "backend command failed");
            return Err(InvokeError::Failed(format!(
                "backend exited with {:?}: {}",
                output.status.code(),
                output.stderr_text()
            )));
        }

        let reply: BridgeReply = serde_json::from_slice(&output.stdout)
            .map_err(|err| InvokeError::Shape(format!("backend reply is not JSON: {err}")))?;
        parse_bridge_reply(reply)
    }
}

fn parse_bridge_reply(reply: BridgeReply) -> Result<ModelReply, InvokeError> {
    if let Some(error) = reply.error {
        return Err(match error.kind.as_str() {
            "missing-model" => InvokeError::MissingArtifact(error.message),
            "shape" => InvokeError::Shape(error.message),
            _ => InvokeError::Failed(error.message),
        });
    }
    let text = match reply.text {
        Some(Value::String(text)) => text,
        Some(other) => {
            return Err(InvokeError::Shape(format!(
                "reply text must be a string, got {other}"
            )));
        }
        None => return Err(InvokeError::Shape("reply has no text".to_string())),
    };
    debug!(chars = text.len(), usage = reply.usage.is_some(), "backend replied");
    Ok(ModelReply {
        text,
        usage: reply.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reply(value: Value) -> Result<ModelReply, InvokeError> {
        parse_bridge_reply(serde_json::from_value(value).expect("bridge reply"))
    }

    #[test]
    fn text_and_usage_are_read() {
        let parsed = reply(json!({
            "text": "{\"a\":1}",
            "usage": {"prompt_tokens": 10, "completion_tokens": 3}
        }))
        .expect("reply");
        assert_eq!(parsed.text, "{\"a\":1}");
        assert_eq!(
            parsed.usage,
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn non_string_text_is_shape_error() {
        let err = reply(json!({"text": {"a": 1}})).expect_err("shape");
        assert_eq!(err.code(), ErrorCode::InvocationShapeError);
        let err = reply(json!({})).expect_err("no text");
        assert_eq!(err.code(), ErrorCode::InvocationShapeError);
    }

    #[test]
    fn bridge_errors_map_to_codes() {
        let err = reply(json!({"error": {"kind": "missing-model", "message": "pull it"}}))
            .expect_err("missing");
        assert_eq!(err.code(), ErrorCode::MissingModelArtifact);
        let err = reply(json!({"error": {"message": "boom"}})).expect_err("failed");
        assert_eq!(err.code(), ErrorCode::InvocationFailure);
    }

    #[test]
    fn missing_command_is_missing_artifact() {
        let model = CommandModel::new(vec!["runllm-no-such-bridge".to_string()], 1024);
        let request = InvokeRequest {
            model: "local/x".to_string(),
            prompt: "hi".to_string(),
            params: Map::new(),
            timeout: Duration::from_secs(5),
        };
        let err = model
            .invoke(&request, &CancelToken::new())
            .expect_err("spawn fails");
        assert_eq!(err.code(), ErrorCode::MissingModelArtifact);
    }

    #[cfg(unix)]
    #[test]
    fn command_bridge_round_trip() {
        let script = "cat >/dev/null\ncat <<'EOF'\n{\"text\":\"{\\\"summary\\\":\\\"ok\\\"}\"}\nEOF\n";
        let model = CommandModel::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            1024,
        );
        let request = InvokeRequest {
            model: "local/x".to_string(),
            prompt: "hi".to_string(),
            params: Map::new(),
            timeout: Duration::from_secs(5),
        };
        let reply = model.invoke(&request, &CancelToken::new()).expect("invoke");
        assert_eq!(reply.text, r#"{"summary":"ok"}"#);
        assert!(reply.usage.is_none());
    }
}
