//! Structured failures shared by every stage of a run.
//!
//! Every failure path maps to exactly one [`ErrorCode`]. The code decides the
//! error type name, the propagation class, the default recovery hint and the
//! documentation anchor, so an [`ErrorPayload`] is always fully populated by
//! the time it leaves the point of failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::schema::Violation;

/// Stable identifiers surfaced to every caller (CLI, registries, stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    MalformedSource,
    MissingMetadata,
    InvalidParameter,
    InputSchemaViolation,
    OutputNotJson,
    OutputNotObject,
    OutputSchemaViolation,
    DependencyCycle,
    DependencyResolution,
    BlockExecutionFailure,
    MissingModelArtifact,
    InvocationShapeError,
    InvocationFailure,
    ContextBudgetExceeded,
    RetryExhausted,
    MissingCredential,
    IncompatibleRuntime,
    Cancelled,
    Unclassified,
}

/// How a failure propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Raised before any model call; never retried.
    FatalPreInvocation,
    /// Consumed by the attempt state machine until the retry budget runs out.
    Retryable,
    /// Aborts the run even in the middle of an attempt sequence.
    FatalMidPipeline,
    /// Final outcome of a run (exhaustion, cancellation, internal faults).
    Terminal,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 19] = [
        ErrorCode::MalformedSource,
        ErrorCode::MissingMetadata,
        ErrorCode::InvalidParameter,
        ErrorCode::InputSchemaViolation,
        ErrorCode::OutputNotJson,
        ErrorCode::OutputNotObject,
        ErrorCode::OutputSchemaViolation,
        ErrorCode::DependencyCycle,
        ErrorCode::DependencyResolution,
        ErrorCode::BlockExecutionFailure,
        ErrorCode::MissingModelArtifact,
        ErrorCode::InvocationShapeError,
        ErrorCode::InvocationFailure,
        ErrorCode::ContextBudgetExceeded,
        ErrorCode::RetryExhausted,
        ErrorCode::MissingCredential,
        ErrorCode::IncompatibleRuntime,
        ErrorCode::Cancelled,
        ErrorCode::Unclassified,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedSource => "malformed-source",
            ErrorCode::MissingMetadata => "missing-metadata",
            ErrorCode::InvalidParameter => "invalid-parameter",
            ErrorCode::InputSchemaViolation => "input-schema-violation",
            ErrorCode::OutputNotJson => "output-not-json",
            ErrorCode::OutputNotObject => "output-not-object",
            ErrorCode::OutputSchemaViolation => "output-schema-violation",
            ErrorCode::DependencyCycle => "dependency-cycle",
            ErrorCode::DependencyResolution => "dependency-resolution",
            ErrorCode::BlockExecutionFailure => "block-execution-failure",
            ErrorCode::MissingModelArtifact => "missing-model-artifact",
            ErrorCode::InvocationShapeError => "invocation-shape-error",
            ErrorCode::InvocationFailure => "invocation-failure",
            ErrorCode::ContextBudgetExceeded => "context-budget-exceeded",
            ErrorCode::RetryExhausted => "retry-exhausted",
            ErrorCode::MissingCredential => "missing-credential",
            ErrorCode::IncompatibleRuntime => "incompatible-runtime",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unclassified => "unclassified",
        }
    }

    pub fn error_type(self) -> &'static str {
        match self {
            ErrorCode::MalformedSource => "ParseError",
            ErrorCode::MissingMetadata => "MetadataValidationError",
            ErrorCode::InvalidParameter => "LLMParamValidationError",
            ErrorCode::InputSchemaViolation => "InputSchemaError",
            ErrorCode::OutputNotJson
            | ErrorCode::OutputNotObject
            | ErrorCode::OutputSchemaViolation => "OutputSchemaError",
            ErrorCode::DependencyCycle | ErrorCode::DependencyResolution => {
                "DependencyResolutionError"
            }
            ErrorCode::BlockExecutionFailure => "BlockExecutionError",
            ErrorCode::MissingModelArtifact => "MissingModelError",
            ErrorCode::InvocationShapeError | ErrorCode::InvocationFailure => "ExecutionError",
            ErrorCode::ContextBudgetExceeded => "ContextWindowExceededError",
            ErrorCode::RetryExhausted => "RetryExhaustedError",
            ErrorCode::MissingCredential => "MissingProviderCredentialError",
            ErrorCode::IncompatibleRuntime => "RuntimeCompatibilityError",
            ErrorCode::Cancelled => "CancelledError",
            ErrorCode::Unclassified => "UnclassifiedError",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorCode::MalformedSource
            | ErrorCode::MissingMetadata
            | ErrorCode::InvalidParameter
            | ErrorCode::InputSchemaViolation
            | ErrorCode::DependencyCycle
            | ErrorCode::ContextBudgetExceeded
            | ErrorCode::IncompatibleRuntime
            | ErrorCode::MissingCredential => ErrorClass::FatalPreInvocation,
            ErrorCode::OutputNotJson
            | ErrorCode::OutputNotObject
            | ErrorCode::OutputSchemaViolation => ErrorClass::Retryable,
            ErrorCode::DependencyResolution
            | ErrorCode::BlockExecutionFailure
            | ErrorCode::MissingModelArtifact
            | ErrorCode::InvocationShapeError
            | ErrorCode::InvocationFailure => ErrorClass::FatalMidPipeline,
            ErrorCode::RetryExhausted | ErrorCode::Cancelled | ErrorCode::Unclassified => {
                ErrorClass::Terminal
            }
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn doc_ref(self) -> String {
        format!("docs/errors.md#{}", self.as_str())
    }

    pub fn default_hint(self) -> &'static str {
        match self {
            ErrorCode::MalformedSource => {
                "Start the file with '---', close the YAML header with '---', then write the instruction body."
            }
            ErrorCode::MissingMetadata => {
                "Add every required header field with the documented type."
            }
            ErrorCode::InvalidParameter => {
                "Remove unsupported llm_params keys or move custom data to metadata."
            }
            ErrorCode::InputSchemaViolation => {
                "Send an input payload that exactly matches input_schema."
            }
            ErrorCode::OutputNotJson => {
                "Respond with only a valid JSON object matching output_schema."
            }
            ErrorCode::OutputNotObject => "Respond with a top-level JSON object.",
            ErrorCode::OutputSchemaViolation => {
                "Return a payload that exactly matches the required schema."
            }
            ErrorCode::DependencyCycle => "Remove circular references in uses entries.",
            ErrorCode::DependencyResolution => {
                "Give every uses entry a unique name and a path to an existing program."
            }
            ErrorCode::BlockExecutionFailure => {
                "Fix the transform block, make it assign an object to `result`, or run it trusted."
            }
            ErrorCode::MissingModelArtifact => {
                "Install the model backend or pull the model before running."
            }
            ErrorCode::InvocationShapeError => {
                "Verify that the backend returns text content for this model."
            }
            ErrorCode::InvocationFailure => {
                "Check backend availability or raise the model timeout."
            }
            ErrorCode::ContextBudgetExceeded => {
                "Send smaller input or increase max_context_window in the program header."
            }
            ErrorCode::RetryExhausted => {
                "Use a more schema-compliant model or tighten the instruction and recovery text."
            }
            ErrorCode::MissingCredential => {
                "Export the provider credential in the environment, then retry."
            }
            ErrorCode::IncompatibleRuntime => {
                "Run the program with a runtime inside its runllm_compat bounds."
            }
            ErrorCode::Cancelled => "Re-run the program when cancellation is not requested.",
            ErrorCode::Unclassified => "Report this failure with the program that triggered it.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized error shape consumed by every caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error_code: ErrorCode,
    pub error_type: String,
    pub message: String,
    pub details: Map<String, Value>,
    pub expected_schema: Option<Value>,
    pub received_payload: Option<Value>,
    pub recovery_hint: String,
    pub doc_ref: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_type: code.error_type().to_string(),
            message: message.into(),
            details: Map::new(),
            expected_schema: None,
            received_payload: None,
            recovery_hint: code.default_hint().to_string(),
            doc_ref: code.doc_ref(),
        }
    }

    /// Payload for a value that failed its contract. Both the schema and the
    /// offending value are mandatory for these kinds.
    pub fn schema_violation(
        code: ErrorCode,
        message: impl Into<String>,
        schema: &Value,
        received: &Value,
        violation: &Violation,
    ) -> Self {
        Self::new(code, message)
            .with_detail("path", violation.path.as_str())
            .with_detail("validator", violation.keyword)
            .with_detail("reason", violation.reason.as_str())
            .with_expected(schema.clone())
            .with_received(received.clone())
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_expected(mut self, schema: Value) -> Self {
        self.expected_schema = Some(schema);
        self
    }

    pub fn with_received(mut self, payload: Value) -> Self {
        self.received_payload = Some(payload);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = hint.into();
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Error returned by every fallible core operation.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", .payload.error_code, .payload.message)]
pub struct RunError {
    payload: Box<ErrorPayload>,
}

pub type RunResult<T> = std::result::Result<T, RunError>;

impl RunError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorPayload::new(code, message).into()
    }

    pub fn code(&self) -> ErrorCode {
        self.payload.error_code
    }

    /// Code of the failure that caused this error.
    ///
    /// For `retry-exhausted` this is the last retryable failure; otherwise the
    /// error's own code.
    pub fn root_code(&self) -> ErrorCode {
        if self.code() != ErrorCode::RetryExhausted {
            return self.code();
        }
        self.payload
            .details
            .get("last_error_code")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(ErrorCode::RetryExhausted)
    }

    pub fn payload(&self) -> &ErrorPayload {
        &self.payload
    }

    pub fn into_payload(self) -> ErrorPayload {
        *self.payload
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Attach a detail to an already constructed error.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.details.insert(key.to_string(), value.into());
        self
    }
}

impl From<ErrorPayload> for RunError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            payload: Box::new(payload),
        }
    }
}
