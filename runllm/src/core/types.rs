//! Shared deterministic types for one program run.
//!
//! These types carry no I/O handles. Serialized forms are part of the CLI
//! output and must stay stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

/// Mutable state threaded through the stages of one run.
///
/// Dependency outputs live under `uses`, keyed by the name the parent gave the
/// dependency. A `BTreeMap` keeps iteration independent of completion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    pub input: Value,
    pub uses: BTreeMap<String, Value>,
    /// Extra fields contributed by the pre-transform block.
    pub fields: Map<String, Value>,
    pub attempt: u32,
    pub rendered: String,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// Apply a pre-transform patch.
    ///
    /// `input` replaces the input payload, `uses` overrides individual
    /// dependency outputs, and every other key becomes an extra field.
    pub fn apply_patch(&mut self, patch: Map<String, Value>) -> Result<(), String> {
        for (key, value) in patch {
            match key.as_str() {
                "input" => {
                    if !value.is_object() {
                        return Err("patched 'input' must be an object".to_string());
                    }
                    self.input = value;
                }
                "uses" => {
                    let Value::Object(overrides) = value else {
                        return Err("patched 'uses' must be an object".to_string());
                    };
                    self.uses.extend(overrides);
                }
                _ => {
                    self.fields.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// Value handed to a pre-transform block as `context`.
    pub fn block_view(&self) -> Value {
        let mut view = self.fields.clone();
        view.insert("input".to_string(), self.input.clone());
        view.insert("uses".to_string(), uses_value(&self.uses));
        Value::Object(view)
    }
}

pub fn uses_value(uses: &BTreeMap<String, Value>) -> Value {
    Value::Object(uses.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Token counts reported by (or estimated for) one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Saturates at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
    }
}

/// Why one attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub code: ErrorCode,
    pub reason: String,
}

/// Diagnostics for one attempt of the retry state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub prompt: String,
    pub failure: Option<AttemptFailure>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Budget-guard estimate for the last rendered prompt.
    pub estimated_prompt_tokens: u64,
    /// True when any attempt's usage came from the estimate, not the backend.
    pub usage_estimated: bool,
}

/// Final outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub program: String,
    pub model: String,
    pub output: Value,
    pub attempts: Vec<AttemptRecord>,
    pub retries: u32,
    pub dependencies: BTreeMap<String, ExecutionResult>,
    pub metrics: RunMetrics,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn patch_routes_input_uses_and_fields() {
        let mut ctx = ExecutionContext::new(json!({"text": "a"}));
        ctx.uses.insert("dep".into(), json!({"v": 1}));
        let patch = json!({
            "input": {"text": "b"},
            "uses": {"dep": {"v": 2}, "extra": {"w": 3}},
            "shout": "B"
        });
        let Value::Object(patch) = patch else { unreachable!() };
        ctx.apply_patch(patch).expect("apply");
        assert_eq!(ctx.input, json!({"text": "b"}));
        assert_eq!(ctx.uses["dep"], json!({"v": 2}));
        assert_eq!(ctx.uses["extra"], json!({"w": 3}));
        assert_eq!(ctx.fields["shout"], json!("B"));
    }

    #[test]
    fn patch_rejects_non_object_input() {
        let mut ctx = ExecutionContext::new(json!({}));
        let mut patch = Map::new();
        patch.insert("input".into(), json!("flat"));
        assert!(ctx.apply_patch(patch).is_err());
    }

    #[test]
    fn block_view_exposes_namespaces() {
        let mut ctx = ExecutionContext::new(json!({"text": "a"}));
        ctx.uses.insert("dep".into(), json!({"v": 1}));
        ctx.fields.insert("note".into(), json!(true));
        assert_eq!(
            ctx.block_view(),
            json!({"input": {"text": "a"}, "uses": {"dep": {"v": 1}}, "note": true})
        );
    }

    #[test]
    fn usage_sums_saturate() {
        let mut usage = TokenUsage {
            prompt_tokens: u64::MAX,
            completion_tokens: 1,
        };
        assert_eq!(usage.total(), u64::MAX);
        usage.add(TokenUsage {
            prompt_tokens: 5,
            completion_tokens: u64::MAX,
        });
        assert_eq!(usage.prompt_tokens, u64::MAX);
        assert_eq!(usage.completion_tokens, u64::MAX);
        assert_eq!(usage.total(), u64::MAX);
    }
}
