//! Deterministic example instances used to steer model output format.

use serde_json::{Map, Number, Value};

/// Upper bound on generated array elements, whatever `minItems` says.
pub const MAX_EXAMPLE_ITEMS: u64 = 3;
/// Nodes nested deeper than this emit `null`.
pub const MAX_EXAMPLE_DEPTH: usize = 8;

const EXAMPLE_STRING: &str = "example";

/// Build a placeholder value shaped like `schema`.
///
/// The same schema always yields the same instance.
pub fn example_instance(schema: &Value) -> Value {
    example_at(schema, 0)
}

fn example_at(schema: &Value, depth: usize) -> Value {
    if depth > MAX_EXAMPLE_DEPTH {
        return Value::Null;
    }
    let Some(node) = schema.as_object() else {
        return Value::Null;
    };

    if let Some(constant) = node.get("const") {
        return constant.clone();
    }
    if let Some(first) = node
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|members| members.first())
    {
        return first.clone();
    }

    match primary_type(node.get("type")) {
        Some("object") => example_object(node, depth),
        Some("array") => {
            let count = node
                .get("minItems")
                .and_then(Value::as_u64)
                .unwrap_or(1)
                .clamp(1, MAX_EXAMPLE_ITEMS);
            let count = node
                .get("maxItems")
                .and_then(Value::as_u64)
                .map_or(count, |max| count.min(max));
            let item = node.get("items").cloned().unwrap_or(Value::Null);
            (0..count).map(|_| example_at(&item, depth + 1)).collect()
        }
        Some("string") => Value::String(example_string(node)),
        Some("integer") => example_integer(node),
        Some("number") => example_number(node),
        Some("boolean") => Value::Bool(false),
        _ => Value::Null,
    }
}

fn primary_type(declared: Option<&Value>) -> Option<&str> {
    match declared? {
        Value::String(name) => Some(name.as_str()),
        Value::Array(names) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            names
                .iter()
                .copied()
                .find(|name| *name != "null")
                .or_else(|| names.first().copied())
        }
        _ => None,
    }
}

fn example_object(node: &Map<String, Value>, depth: usize) -> Value {
    let Some(props) = node.get("properties").and_then(Value::as_object) else {
        return Value::Object(Map::new());
    };
    let keys: Vec<&str> = match node.get("required").and_then(Value::as_array) {
        Some(required) => required.iter().filter_map(Value::as_str).collect(),
        None => props.keys().map(String::as_str).collect(),
    };
    let mut out = Map::new();
    for key in keys {
        let child = props.get(key).cloned().unwrap_or(Value::Null);
        out.insert(key.to_string(), example_at(&child, depth + 1));
    }
    Value::Object(out)
}

fn example_string(node: &Map<String, Value>) -> String {
    let mut text = EXAMPLE_STRING.to_string();
    if let Some(min) = node.get("minLength").and_then(Value::as_u64) {
        while (text.chars().count() as u64) < min {
            text.push('x');
        }
    }
    if let Some(max) = node.get("maxLength").and_then(Value::as_u64) {
        text = text.chars().take(max as usize).collect();
    }
    text
}

fn example_integer(node: &Map<String, Value>) -> Value {
    let bound = |key: &str| node.get(key).and_then(Value::as_f64);
    let mut value: i64 = 0;
    if let Some(min) = bound("minimum") {
        value = value.max(min.ceil() as i64);
    }
    if let Some(min) = bound("exclusiveMinimum") {
        value = value.max(min.floor() as i64 + 1);
    }
    if let Some(max) = bound("maximum") {
        value = value.min(max.floor() as i64);
    }
    if let Some(max) = bound("exclusiveMaximum") {
        value = value.min(max.ceil() as i64 - 1);
    }
    Value::Number(value.into())
}

fn example_number(node: &Map<String, Value>) -> Value {
    let bound = |key: &str| node.get(key).and_then(Value::as_f64);
    let mut value = 0.0_f64;
    if let Some(min) = bound("minimum") {
        value = value.max(min);
    }
    if let Some(min) = bound("exclusiveMinimum")
        && value <= min
    {
        value = min + 1.0;
    }
    if let Some(max) = bound("maximum") {
        value = value.min(max);
    }
    if let Some(max) = bound("exclusiveMaximum")
        && value >= max
    {
        value = max - 1.0;
    }
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::schema::validate;

    #[test]
    fn nested_required_fields_are_emitted() {
        let schema = json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "meta": {
                    "type": "object",
                    "properties": {
                        "score": {"type": "number", "minimum": 1},
                        "note": {"type": "string"}
                    },
                    "required": ["score"]
                }
            },
            "required": ["summary", "meta"],
            "additionalProperties": false
        });
        let example = example_instance(&schema);
        assert_eq!(example, json!({"summary": "example", "meta": {"score": 1.0}}));
        validate(&schema, &example).expect("example satisfies schema");
    }

    #[test]
    fn large_min_items_is_capped() {
        let schema = json!({"type": "array", "items": {"type": "integer"}, "minItems": 50});
        let example = example_instance(&schema);
        assert_eq!(example.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn small_min_items_is_honored() {
        let schema = json!({"type": "array", "items": {"type": "boolean"}, "minItems": 2});
        assert_eq!(example_instance(&schema), json!([false, false]));
    }

    #[test]
    fn enum_const_and_nullable_unions() {
        assert_eq!(example_instance(&json!({"type": "string", "enum": ["b", "a"]})), "b");
        assert_eq!(example_instance(&json!({"type": "integer", "const": 7})), 7);
        assert_eq!(example_instance(&json!({"type": ["null", "string"]})), "example");
    }

    #[test]
    fn string_length_bounds_are_respected() {
        let long = example_instance(&json!({"type": "string", "minLength": 10}));
        assert_eq!(long, "examplexxx");
        let short = example_instance(&json!({"type": "string", "maxLength": 3}));
        assert_eq!(short, "exa");
    }

    #[test]
    fn deep_nesting_stops_at_depth_cap() {
        let mut schema = json!({"type": "string"});
        for _ in 0..12 {
            schema = json!({"type": "object", "properties": {"n": schema}, "required": ["n"]});
        }
        let example = example_instance(&schema);
        let mut cursor = &example;
        let mut depth = 0;
        while let Some(next) = cursor.get("n") {
            cursor = next;
            depth += 1;
        }
        assert_eq!(depth, MAX_EXAMPLE_DEPTH + 1);
        assert!(cursor.is_null());
    }

    #[test]
    fn generation_is_deterministic() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "integer", "minimum": 5}}});
        assert_eq!(example_instance(&schema), example_instance(&schema));
        assert_eq!(example_instance(&schema), json!({"a": 5}));
    }
}
