//! Engine configuration stored as TOML (default `runllm.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::engine::RunOptions;
use crate::io::sandbox::SandboxPolicy;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides every program's `llm.model` when set.
    pub default_model: Option<String>,

    /// Retries after the first attempt; 0 means exactly one attempt.
    pub max_retries: u32,

    /// Wall-clock bound for one model call.
    pub model_timeout_secs: u64,

    /// Run independent dependencies on parallel threads.
    pub parallel_dependencies: bool,

    /// Append every attempt's prompt to this file.
    pub prompt_log: Option<PathBuf>,

    pub blocks: BlockConfig,
    pub backend: BackendConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlockConfig {
    pub trusted: bool,
    pub timeout_secs: u64,
    /// 0 disables the memory ceiling.
    pub memory_limit_mb: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Bridge command that performs model calls (e.g. `["runllm-bridge"]`).
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            trusted: false,
            timeout_secs: 2,
            memory_limit_mb: 256,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["runllm-bridge".to_string()],
            output_limit_bytes: 4_000_000,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".runllm").join("stats.jsonl"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            max_retries: 2,
            model_timeout_secs: 120,
            parallel_dependencies: true,
            prompt_log: None,
            blocks: BlockConfig::default(),
            backend: BackendConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_timeout_secs == 0 {
            return Err(anyhow!("model_timeout_secs must be > 0"));
        }
        if self.blocks.timeout_secs == 0 {
            return Err(anyhow!("blocks.timeout_secs must be > 0"));
        }
        if self.blocks.output_limit_bytes == 0 {
            return Err(anyhow!("blocks.output_limit_bytes must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        if self
            .default_model
            .as_deref()
            .is_some_and(|model| model.trim().is_empty())
        {
            return Err(anyhow!("default_model must not be blank"));
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_retries: self.max_retries,
            model_override: self.default_model.clone(),
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            parallel_dependencies: self.parallel_dependencies,
            prompt_log: self.prompt_log.clone(),
        }
    }

    pub fn sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            trusted: self.blocks.trusted,
            timeout: Duration::from_secs(self.blocks.timeout_secs),
            memory_limit_mb: self.blocks.memory_limit_mb,
            output_limit_bytes: self.blocks.output_limit_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
