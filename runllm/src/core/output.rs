//! Model response parsing and output-contract selection.

use std::collections::HashSet;

use serde_json::{Deserializer, Map, Value};

use crate::core::schema::{Violation, validate};
use crate::error::ErrorCode;

/// Shape of a raw model response before schema validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Distinct JSON objects found in the text, in order of appearance.
    Candidates(Vec<Map<String, Value>>),
    /// Valid JSON, but no object anywhere in it.
    NotObject(Value),
    NotJson(String),
}

/// Parse a response into object candidates.
///
/// The whole trimmed text is tried first; otherwise every `{` offset is tried
/// as the start of one JSON value, so prose and markdown fences around the
/// payload are ignored.
pub fn parse_response(text: &str) -> ParsedResponse {
    let trimmed = text.trim();
    let whole = serde_json::from_str::<Value>(trimmed);
    if let Ok(Value::Object(map)) = whole {
        return ParsedResponse::Candidates(vec![map]);
    }

    let candidates = scan_objects(trimmed);
    if !candidates.is_empty() {
        return ParsedResponse::Candidates(candidates);
    }
    match whole {
        Ok(value) => ParsedResponse::NotObject(value),
        Err(err) => ParsedResponse::NotJson(err.to_string()),
    }
}

fn scan_objects(text: &str) -> Vec<Map<String, Value>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, _) in text.match_indices('{') {
        let mut stream = Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        let Some(Ok(Value::Object(map))) = stream.next() else {
            continue;
        };
        // serde_json maps are key-sorted, so the compact form is canonical.
        let key = serde_json::to_string(&map).unwrap_or_default();
        if seen.insert(key) {
            out.push(map);
        }
    }
    out
}

/// Why a response could not be accepted as output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRejection {
    pub code: ErrorCode,
    pub reason: String,
    pub received: Value,
    pub violation: Option<Violation>,
}

/// Pick the first candidate that satisfies `schema`.
///
/// When every candidate fails, the first candidate's violation is reported.
pub fn select_output(text: &str, schema: &Value) -> Result<Map<String, Value>, OutputRejection> {
    match parse_response(text) {
        ParsedResponse::NotJson(err) => Err(OutputRejection {
            code: ErrorCode::OutputNotJson,
            reason: format!("response is not valid JSON: {err}"),
            received: Value::String(text.to_string()),
            violation: None,
        }),
        ParsedResponse::NotObject(value) => Err(OutputRejection {
            code: ErrorCode::OutputNotObject,
            reason: format!("response is JSON {} but not an object", json_kind(&value)),
            received: value,
            violation: None,
        }),
        ParsedResponse::Candidates(candidates) => {
            let mut first_failure = None;
            for candidate in candidates {
                let value = Value::Object(candidate.clone());
                match validate(schema, &value) {
                    Ok(()) => return Ok(candidate),
                    Err(violation) => {
                        if first_failure.is_none() {
                            first_failure = Some((value, violation));
                        }
                    }
                }
            }
            let (received, violation) = first_failure.unwrap_or_else(|| {
                (
                    Value::Object(Map::new()),
                    Violation {
                        path: "$".to_string(),
                        keyword: "type",
                        reason: "no candidate object".to_string(),
                    },
                )
            });
            Err(OutputRejection {
                code: ErrorCode::OutputSchemaViolation,
                reason: violation.to_string(),
                received,
                violation: Some(violation),
            })
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn summary_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"],
            "additionalProperties": false
        })
    }

    #[test]
    fn plain_object_is_single_candidate() {
        let parsed = parse_response(" {\"summary\": \"ok\"} \n");
        let ParsedResponse::Candidates(candidates) = parsed else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn extracts_object_from_markdown_fence() {
        let text = "Sure!\n```json\n{\"summary\": \"ok\"}\n```\nAnything else?";
        let output = select_output(text, &summary_schema()).expect("fenced object");
        assert_eq!(Value::Object(output), json!({"summary": "ok"}));
    }

    #[test]
    fn picks_first_valid_candidate() {
        let text = r#"draft: {"note": 1} final: {"summary": "done"}"#;
        let output = select_output(text, &summary_schema()).expect("second candidate");
        assert_eq!(output["summary"], "done");
    }

    #[test]
    fn free_text_is_not_json() {
        let err = select_output("I cannot answer that.", &summary_schema()).expect_err("text");
        assert_eq!(err.code, ErrorCode::OutputNotJson);
    }

    #[test]
    fn array_without_objects_is_not_object() {
        let err = select_output("[1, 2, 3]", &summary_schema()).expect_err("array");
        assert_eq!(err.code, ErrorCode::OutputNotObject);
        assert_eq!(err.received, json!([1, 2, 3]));
    }

    #[test]
    fn invalid_candidates_report_first_violation() {
        let err = select_output(r#"{"other": 1} {"summary": 2}"#, &summary_schema())
            .expect_err("no valid candidate");
        assert_eq!(err.code, ErrorCode::OutputSchemaViolation);
        assert_eq!(err.received, json!({"other": 1}));
        let violation = err.violation.expect("violation");
        assert_eq!(violation.keyword, "required");
    }

    #[test]
    fn duplicate_candidates_are_collapsed() {
        let ParsedResponse::Candidates(candidates) =
            parse_response(r#"{"a":1} and again {"a": 1}"#)
        else {
            panic!("expected candidates");
        };
        assert_eq!(candidates.len(), 1);
    }
}
