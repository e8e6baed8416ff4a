//! Attempt prompt assembly: instruction + contract block + recovery text.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;

use crate::core::example::example_instance;

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const ATTEMPT_TEMPLATE: &str = include_str!("prompts/attempt.md");

pub const STRICT_DIRECTIVE: &str = "Return ONLY one valid JSON object.";
pub const DEFAULT_RECOVERY: &str = "Last attempt did not satisfy output_schema. Respond with only a valid JSON object that satisfies output_schema.";

/// Steering text derived from an output schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractBlock {
    pub schema_text: String,
    pub example: String,
    pub directive: &'static str,
}

impl ContractBlock {
    pub fn from_schema(schema: &Value) -> Self {
        let pretty = |value: &Value| serde_json::to_string_pretty(value).unwrap_or_default();
        Self {
            schema_text: pretty(schema),
            example: pretty(&example_instance(schema)),
            directive: STRICT_DIRECTIVE,
        }
    }
}

/// Inputs for one attempt's prompt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptPrompt<'a> {
    pub instruction: &'a str,
    pub contract: &'a ContractBlock,
    /// `Some` from the second attempt on.
    pub recovery: Option<&'a str>,
    pub previous_failure: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("contract", CONTRACT_TEMPLATE)
            .expect("contract template should be valid");
        env.add_template("attempt", ATTEMPT_TEMPLATE)
            .expect("attempt template should be valid");
        Self { env }
    }

    pub fn render_contract(&self, block: &ContractBlock) -> Result<String> {
        let template = self.env.get_template("contract")?;
        let rendered = template.render(context! {
            directive => block.directive,
            schema => block.schema_text,
            example => block.example,
        })?;
        Ok(rendered)
    }

    pub fn render_attempt(&self, prompt: &AttemptPrompt<'_>) -> Result<String> {
        let contract = self.render_contract(prompt.contract)?;
        let template = self.env.get_template("attempt")?;
        let rendered = template.render(context! {
            instruction => prompt.instruction.trim(),
            contract => contract,
            recovery => prompt.recovery.map(str::trim).filter(|s| !s.is_empty()),
            previous_failure => prompt.previous_failure.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

/// Append one attempt's prompt to a debug log file.
pub fn append_prompt_log(
    path: &Path,
    attempt: u32,
    max_attempts: u32,
    model: &str,
    prompt: &str,
) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create prompt log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open prompt log {}", path.display()))?;
    let block = format!(
        "===== Attempt {attempt}/{max_attempts} =====\nModel: {model}\n----- Prompt -----\n{prompt}\n"
    );
    file.write_all(block.as_bytes())
        .with_context(|| format!("append prompt log {}", path.display()))
}
