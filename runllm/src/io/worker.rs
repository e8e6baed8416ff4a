//! Worker side of the block sandbox.
//!
//! Runs inside the `block-worker` child process. The block is JavaScript
//! evaluated by `boa_engine`: it reads the global `context` and assigns an
//! object (or nothing) to the global `result`. Resource limits are enforced by
//! the host, which kills this process on breach.

use std::io::{Read, Write};

use anyhow::{Context as _, Result};
use boa_engine::{Context, Source};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Globals that survive in untrusted mode.
pub const ALLOWED_GLOBALS: &[&str] = &[
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Math",
    "JSON",
    "Date",
    "RegExp",
    "Map",
    "Set",
    "Error",
    "TypeError",
    "RangeError",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "NaN",
    "Infinity",
    "undefined",
    "globalThis",
    "encodeURIComponent",
    "decodeURIComponent",
    "context",
    "result",
];

const RECURSION_LIMIT: usize = 512;
const INVALID_PREFIX: &str = "__invalid__:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStage {
    Pre,
    Post,
}

impl BlockStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockStage::Pre => "pre",
            BlockStage::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub stage: BlockStage,
    pub source: String,
    pub context: Value,
    pub trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReply {
    fn from_outcome(outcome: Result<Map<String, Value>, String>) -> Self {
        match outcome {
            Ok(patch) if patch.is_empty() => Self {
                ok: true,
                result: Some(Value::Null),
                error: None,
            },
            Ok(patch) => Self {
                ok: true,
                result: Some(Value::Object(patch)),
                error: None,
            },
            Err(error) => Self {
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Evaluate one block and return its patch.
///
/// An unset or null `result` is an empty patch. Any other non-object result,
/// and any thrown exception, is an error.
pub fn evaluate_block(request: &WorkerRequest) -> Result<Map<String, Value>, String> {
    let mut context = Context::default();
    if !request.trusted {
        context
            .runtime_limits_mut()
            .set_recursion_limit(RECURSION_LIMIT);
    }

    let context_json = serde_json::to_string(&request.context)
        .map_err(|e| format!("serialize context: {e}"))?;
    let env_setup = if request.trusted {
        let env: Map<String, Value> = std::env::vars()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        let env_json =
            serde_json::to_string(&env).map_err(|e| format!("serialize env: {e}"))?;
        format!("var env = JSON.parse('{}');", escape_js(&env_json))
    } else {
        String::new()
    };

    let full_code = format!(
        r#"
{security_setup}
var context = JSON.parse('{context_json}');
var result = undefined;
{env_setup}

{code}

(function() {{
    var __r = result;
    if (__r === undefined || __r === null) {{ return "null"; }}
    if (typeof __r !== 'object' || Array.isArray(__r)) {{
        return "{INVALID_PREFIX}" + (Array.isArray(__r) ? "array" : typeof __r);
    }}
    return JSON.stringify(__r);
}})();
"#,
        security_setup = if request.trusted {
            String::new()
        } else {
            security_prelude()
        },
        context_json = escape_js(&context_json),
        code = request.source,
    );

    let value = context
        .eval(Source::from_bytes(&full_code))
        .map_err(|e| format!("{} block raised: {e}", request.stage.as_str()))?;
    let text = value
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| format!("{} block produced no result", request.stage.as_str()))?;

    if let Some(kind) = text.strip_prefix(INVALID_PREFIX) {
        return Err(format!(
            "{} block must assign an object to `result`, got {kind}",
            request.stage.as_str()
        ));
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Null) => Ok(Map::new()),
        Ok(Value::Object(patch)) => Ok(patch),
        Ok(other) => Err(format!("block result is not an object: {other}")),
        Err(e) => Err(format!("block result is not serializable: {e}")),
    }
}

fn security_prelude() -> String {
    let allowed = ALLOWED_GLOBALS
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"
(function() {{
    var allowed = new Set([{allowed}]);
    var g = globalThis;
    Object.getOwnPropertyNames(g).forEach(function(key) {{
        if (!allowed.has(key)) {{
            try {{ delete g[key]; }} catch (e) {{ g[key] = undefined; }}
        }}
    }});
}})();
"#
    )
}

fn escape_js(json: &str) -> String {
    json.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// Entry point of the `block-worker` subcommand: one request in, one reply out.
pub fn serve<R: Read, W: Write>(mut input: R, mut output: W) -> Result<()> {
    let mut raw = String::new();
    input.read_to_string(&mut raw).context("read worker request")?;
    let reply = match serde_json::from_str::<WorkerRequest>(&raw) {
        Ok(request) => WorkerReply::from_outcome(evaluate_block(&request)),
        Err(e) => WorkerReply::from_outcome(Err(format!("malformed worker request: {e}"))),
    };
    serde_json::to_writer(&mut output, &reply).context("write worker reply")?;
    output.flush().context("flush worker reply")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(source: &str, context: Value, trusted: bool) -> WorkerRequest {
        WorkerRequest {
            stage: BlockStage::Pre,
            source: source.to_string(),
            context,
            trusted,
        }
    }

    #[test]
    fn block_reads_context_and_returns_patch() {
        let patch = evaluate_block(&request(
            "result = { shout: context.input.text.toUpperCase() };",
            json!({"input": {"text": "it's \"quoted\""}}),
            false,
        ))
        .expect("patch");
        assert_eq!(Value::Object(patch), json!({"shout": "IT'S \"QUOTED\""}));
    }

    #[test]
    fn unset_result_is_empty_patch() {
        let patch = evaluate_block(&request("var x = 1;", json!({}), false)).expect("empty");
        assert!(patch.is_empty());
        let patch = evaluate_block(&request("result = null;", json!({}), false)).expect("null");
        assert!(patch.is_empty());
    }

    #[test]
    fn non_object_results_are_rejected() {
        for source in ["result = 3;", "result = [1];", "result = 'x';", "result = function() {};"] {
            let err = evaluate_block(&request(source, json!({}), false)).expect_err(source);
            assert!(err.contains("must assign an object"), "{source}: {err}");
        }
    }

    #[test]
    fn thrown_errors_are_reported() {
        let err = evaluate_block(&request("throw new Error('boom');", json!({}), false))
            .expect_err("throw");
        assert!(err.contains("boom"), "{err}");
    }

    #[test]
    fn untrusted_mode_strips_non_allowlisted_globals() {
        let patch = evaluate_block(&request(
            "result = { eval: typeof eval, math: typeof Math, env: typeof env };",
            json!({}),
            false,
        ))
        .expect("patch");
        assert_eq!(
            Value::Object(patch),
            json!({"eval": "undefined", "math": "object", "env": "undefined"})
        );
    }

    #[test]
    fn trusted_mode_keeps_intrinsics_and_env() {
        let patch = evaluate_block(&request(
            "result = { eval: typeof eval, env: typeof env };",
            json!({}),
            true,
        ))
        .expect("patch");
        assert_eq!(
            Value::Object(patch),
            json!({"eval": "function", "env": "object"})
        );
    }

    #[test]
    fn serve_writes_reply_json() {
        let request = json!({
            "stage": "post",
            "source": "result = { total: context.output.n + 1 };",
            "context": {"output": {"n": 1}},
            "trusted": false
        });
        let mut out = Vec::new();
        serve(request.to_string().as_bytes(), &mut out).expect("serve");
        let reply: WorkerReply = serde_json::from_slice(&out).expect("reply");
        assert!(reply.ok);
        assert_eq!(reply.result, Some(json!({"total": 2})));
    }

    #[test]
    fn serve_reports_malformed_request() {
        let mut out = Vec::new();
        serve(&b"not json"[..], &mut out).expect("serve");
        let reply: WorkerReply = serde_json::from_slice(&out).expect("reply");
        assert!(!reply.ok);
        assert!(reply.error.expect("error").contains("malformed"));
    }
}
