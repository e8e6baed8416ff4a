//! Placeholder substitution for instruction text and dependency bindings.
//!
//! A placeholder is `{{ path }}`. Its first segment selects the namespace:
//! `input.*` reads the current input payload, `uses.<name>.*` reads a
//! completed dependency's output, and anything else reads an extra field
//! contributed by a pre-transform block. Unresolved paths render as "".

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::types::ExecutionContext;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\-\.]*)\s*\}\}")
        .expect("placeholder regex should compile")
});

/// Resolved lookup target for one placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// Path into the current input payload.
    Input(Vec<String>),
    /// Path into one named dependency's validated output.
    Dependency { name: String, path: Vec<String> },
    /// Path into fields added by the pre-transform block.
    Field(Vec<String>),
}

impl Placeholder {
    pub fn parse(expression: &str) -> Self {
        let mut segments = expression
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);
        match segments.next().as_deref() {
            Some("input") => Placeholder::Input(segments.collect()),
            Some("uses") => match segments.next() {
                Some(name) => Placeholder::Dependency {
                    name,
                    path: segments.collect(),
                },
                None => Placeholder::Field(vec!["uses".to_string()]),
            },
            Some(first) => {
                let mut path = vec![first.to_string()];
                path.extend(segments);
                Placeholder::Field(path)
            }
            None => Placeholder::Field(Vec::new()),
        }
    }

    fn resolve<'a>(&self, ctx: &'a ExecutionContext) -> Option<&'a Value> {
        match self {
            Placeholder::Input(path) => lookup(&ctx.input, path),
            Placeholder::Dependency { name, path } => {
                ctx.uses.get(name).and_then(|output| lookup(output, path))
            }
            Placeholder::Field(path) => {
                let (first, rest) = path.split_first()?;
                ctx.fields.get(first).and_then(|value| lookup(value, rest))
            }
        }
    }
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render one resolved value as placeholder text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Substitute every placeholder in `template` from `ctx`.
pub fn render(template: &str, ctx: &ExecutionContext) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            Placeholder::parse(&caps[1])
                .resolve(ctx)
                .map(value_text)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Every placeholder referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| Placeholder::parse(&caps[1]))
        .collect()
}

/// Names of dependencies referenced through `uses.<name>` placeholders.
pub fn referenced_dependencies(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    for placeholder in placeholders(template) {
        if let Placeholder::Dependency { name, .. } = placeholder
            && !names.contains(&name)
        {
            names.push(name);
        }
    }
    names
}
