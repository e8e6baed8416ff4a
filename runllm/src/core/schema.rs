//! Contract validator: schema well-formedness and instance validation.
//!
//! Both passes are pure functions of their inputs. Instance validation stops at
//! the first offending node and reports it as a [`Violation`] so callers can
//! build precise recovery instructions.

use std::fmt;

use jsonschema::Draft;
use regex::Regex;
use serde_json::{Map, Value};

const RECOGNIZED_KEYS: &[&str] = &[
    "type",
    "properties",
    "required",
    "additionalProperties",
    "items",
    "enum",
    "const",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "pattern",
    "format",
    "title",
    "description",
    "default",
    "examples",
    "$schema",
    "$id",
];

const TYPE_NAMES: &[&str] = &[
    "object", "array", "string", "integer", "number", "boolean", "null",
];

/// First mismatch found while validating an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Location of the offending value, e.g. `$.items[2].name`.
    pub path: String,
    /// Schema keyword that rejected the value.
    pub keyword: &'static str,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.reason, self.keyword)
    }
}

/// Structural problem in a schema description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Check that a schema only uses supported keywords and is internally consistent.
pub fn check_schema(schema: &Value) -> Result<(), SchemaError> {
    check_node(schema, "$")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map(|_| ())
        .map_err(|err| SchemaError {
            path: "$".to_string(),
            reason: format!("schema does not compile: {err}"),
        })
}

fn schema_error(path: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn check_node(schema: &Value, path: &str) -> Result<(), SchemaError> {
    let Some(node) = schema.as_object() else {
        return Err(schema_error(path, "schema node must be a mapping"));
    };

    if let Some(unknown) = node.keys().find(|key| !RECOGNIZED_KEYS.contains(&key.as_str())) {
        return Err(schema_error(path, format!("unsupported keyword '{unknown}'")));
    }

    match node.get("type") {
        None => return Err(schema_error(path, "missing 'type'")),
        Some(value) if declared_types(value).is_none() => {
            return Err(schema_error(path, "'type' must name supported type(s)"));
        }
        Some(_) => {}
    }

    for key in ["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"] {
        if let Some(value) = node.get(key)
            && !value.is_number()
        {
            return Err(schema_error(path, format!("'{key}' must be a number")));
        }
    }
    for key in ["minLength", "maxLength", "minItems", "maxItems"] {
        if let Some(value) = node.get(key)
            && value.as_u64().is_none()
        {
            return Err(schema_error(
                path,
                format!("'{key}' must be a non-negative integer"),
            ));
        }
    }

    if let Some(pattern) = node.get("pattern") {
        let Some(pattern) = pattern.as_str() else {
            return Err(schema_error(path, "'pattern' must be a string"));
        };
        Regex::new(pattern)
            .map_err(|err| schema_error(path, format!("'pattern' does not compile: {err}")))?;
    }

    if let Some(members) = node.get("enum") {
        match members.as_array() {
            Some(list) if !list.is_empty() => {}
            _ => return Err(schema_error(path, "'enum' must be a non-empty list")),
        }
    }

    if let Some(value) = node.get("additionalProperties")
        && !value.is_boolean()
    {
        return Err(schema_error(path, "'additionalProperties' must be a boolean"));
    }

    let properties = match node.get("properties") {
        None => None,
        Some(Value::Object(props)) => Some(props),
        Some(_) => return Err(schema_error(path, "'properties' must be a mapping")),
    };
    if let Some(props) = properties {
        for (name, child) in props {
            check_node(child, &format!("{path}.properties.{name}"))?;
        }
    }

    if let Some(required) = node.get("required") {
        let Some(list) = required.as_array() else {
            return Err(schema_error(path, "'required' must be a list"));
        };
        for entry in list {
            let Some(name) = entry.as_str() else {
                return Err(schema_error(path, "'required' entries must be strings"));
            };
            if !properties.is_some_and(|props| props.contains_key(name)) {
                return Err(schema_error(
                    path,
                    format!("required field '{name}' is not declared in 'properties'"),
                ));
            }
        }
    }

    if let Some(items) = node.get("items") {
        check_node(items, &format!("{path}.items"))?;
    }

    Ok(())
}

fn declared_types(value: &Value) -> Option<Vec<&str>> {
    let names: Vec<&str> = match value {
        Value::String(name) => vec![name.as_str()],
        Value::Array(list) if !list.is_empty() => {
            list.iter().map(Value::as_str).collect::<Option<_>>()?
        }
        _ => return None,
    };
    names
        .iter()
        .all(|name| TYPE_NAMES.contains(name))
        .then_some(names)
}

/// Validate `value` against `schema`, returning the first violation.
pub fn validate(schema: &Value, value: &Value) -> Result<(), Violation> {
    validate_at(schema, value, "$")
}

fn violation(path: &str, keyword: &'static str, reason: impl Into<String>) -> Violation {
    Violation {
        path: path.to_string(),
        keyword,
        reason: reason.into(),
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), Violation> {
    let Some(node) = schema.as_object() else {
        return Ok(());
    };

    if let Some(types) = node.get("type").and_then(declared_types)
        && !types.iter().any(|name| matches_type(name, value))
    {
        return Err(violation(
            path,
            "type",
            format!("expected {}, got {}", types.join(" | "), type_name(value)),
        ));
    }

    if let Some(expected) = node.get("const")
        && expected != value
    {
        return Err(violation(path, "const", format!("expected constant {expected}")));
    }

    if let Some(Value::Array(members)) = node.get("enum")
        && !members.contains(value)
    {
        return Err(violation(
            path,
            "enum",
            format!("{value} is not one of {}", Value::Array(members.clone())),
        ));
    }

    if let Some(number) = value.as_f64() {
        check_numeric(node, number, path)?;
    }

    if let Value::String(text) = value {
        check_string(node, text, path)?;
    }

    if let Value::Array(items) = value {
        check_array(node, items, path)?;
    }

    if let Value::Object(fields) = value {
        check_object(node, fields, path)?;
    }

    Ok(())
}

fn check_numeric(node: &Map<String, Value>, number: f64, path: &str) -> Result<(), Violation> {
    let bound = |key: &str| node.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum")
        && number < min
    {
        return Err(violation(path, "minimum", format!("{number} is less than {min}")));
    }
    if let Some(max) = bound("maximum")
        && number > max
    {
        return Err(violation(path, "maximum", format!("{number} is greater than {max}")));
    }
    if let Some(min) = bound("exclusiveMinimum")
        && number <= min
    {
        return Err(violation(
            path,
            "exclusiveMinimum",
            format!("{number} must be greater than {min}"),
        ));
    }
    if let Some(max) = bound("exclusiveMaximum")
        && number >= max
    {
        return Err(violation(
            path,
            "exclusiveMaximum",
            format!("{number} must be less than {max}"),
        ));
    }
    Ok(())
}

fn check_string(node: &Map<String, Value>, text: &str, path: &str) -> Result<(), Violation> {
    let length = text.chars().count() as u64;
    if let Some(min) = node.get("minLength").and_then(Value::as_u64)
        && length < min
    {
        return Err(violation(
            path,
            "minLength",
            format!("length {length} is shorter than {min}"),
        ));
    }
    if let Some(max) = node.get("maxLength").and_then(Value::as_u64)
        && length > max
    {
        return Err(violation(
            path,
            "maxLength",
            format!("length {length} is longer than {max}"),
        ));
    }
    if let Some(pattern) = node.get("pattern").and_then(Value::as_str) {
        let matched = Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false);
        if !matched {
            return Err(violation(
                path,
                "pattern",
                format!("{text:?} does not match {pattern:?}"),
            ));
        }
    }
    Ok(())
}

fn check_array(node: &Map<String, Value>, items: &[Value], path: &str) -> Result<(), Violation> {
    let count = items.len() as u64;
    if let Some(min) = node.get("minItems").and_then(Value::as_u64)
        && count < min
    {
        return Err(violation(
            path,
            "minItems",
            format!("{count} items, expected at least {min}"),
        ));
    }
    if let Some(max) = node.get("maxItems").and_then(Value::as_u64)
        && count > max
    {
        return Err(violation(
            path,
            "maxItems",
            format!("{count} items, expected at most {max}"),
        ));
    }
    if let Some(item_schema) = node.get("items") {
        for (index, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{path}[{index}]"))?;
        }
    }
    Ok(())
}

fn check_object(
    node: &Map<String, Value>,
    fields: &Map<String, Value>,
    path: &str,
) -> Result<(), Violation> {
    if let Some(Value::Array(required)) = node.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return Err(violation(
                    &format!("{path}.{name}"),
                    "required",
                    format!("missing required field '{name}'"),
                ));
            }
        }
    }

    let properties = node.get("properties").and_then(Value::as_object);
    if let Some(props) = properties {
        for (name, child) in props {
            if let Some(field) = fields.get(name) {
                validate_at(child, field, &format!("{path}.{name}"))?;
            }
        }
    }

    if node.get("additionalProperties") == Some(&Value::Bool(false))
        && let Some(extra) = fields
            .keys()
            .find(|key| !properties.is_some_and(|props| props.contains_key(key.as_str())))
    {
        return Err(violation(
            &format!("{path}.{extra}"),
            "additionalProperties",
            format!("undeclared field '{extra}' is not allowed"),
        ));
    }
    Ok(())
}

fn matches_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.is_finite() && n.fract() == 0.0)
        }
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
