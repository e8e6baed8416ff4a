//! `runllm` command line.
//!
//! Runs a program unit and prints its validated output as JSON. Failures print
//! the structured error payload on stderr.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::runtime::Builder;
use tracing::warn;

use runllm::cancel::CancelToken;
use runllm::engine::{Engine, RunOptions};
use runllm::error::RunError;
use runllm::exit_codes;
use runllm::io::config::{EngineConfig, load_config};
use runllm::io::model::CommandModel;
use runllm::io::program::ProgramCache;
use runllm::io::sandbox::{BlockRunner, WorkerCommand};
use runllm::io::stats::{JsonlStatsStore, NullStats, StatsSink, estimate_latency_ms};
use runllm::io::worker;
use runllm::resolve::resolve;

#[derive(Parser)]
#[command(
    name = "runllm",
    version,
    about = "Run contract-enforced LLM program units"
)]
struct Cli {
    /// Engine config file.
    #[arg(long, global = true, default_value = "runllm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program and print its output JSON.
    Run {
        program: PathBuf,
        /// Input payload as a JSON object.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Read the input payload from a file.
        #[arg(long)]
        input_file: Option<PathBuf>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Override the program's model.
        #[arg(long)]
        model: Option<String>,
        /// Run transform blocks without capability restrictions.
        #[arg(long)]
        trusted_blocks: bool,
        /// Print the full execution result instead of only the output.
        #[arg(long)]
        full: bool,
    },
    /// Load a program, resolve its dependencies, and print the execution order.
    Check { program: PathBuf },
    /// Print recorded statistics for a program.
    Stats {
        program: PathBuf,
        #[arg(long)]
        model: Option<String>,
    },
    /// Evaluate one transform block read from stdin (used by the sandbox).
    #[command(hide = true)]
    BlockWorker,
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::BlockWorker = cli.command {
        worker::serve(io::stdin().lock(), io::stdout().lock())?;
        return Ok(exit_codes::OK);
    }

    runllm::logging::init();
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Run {
            program,
            input,
            input_file,
            max_retries,
            model,
            trusted_blocks,
            full,
        } => {
            let input = read_input(input.as_deref(), input_file.as_deref())?;
            let mut options = config.run_options();
            apply_overrides(&mut options, max_retries, model);
            cmd_run(&config, &program, input, &options, trusted_blocks, full)
        }
        Command::Check { program } => cmd_check(&program),
        Command::Stats { program, model } => cmd_stats(&config, &program, model.as_deref()),
        Command::BlockWorker => Ok(exit_codes::OK),
    }
}

fn apply_overrides(options: &mut RunOptions, max_retries: Option<u32>, model: Option<String>) {
    if let Some(max_retries) = max_retries {
        options.max_retries = max_retries;
    }
    if model.is_some() {
        options.model_override = model;
    }
}

fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => return Ok(json!({})),
    };
    serde_json::from_str(&raw).context("parse input JSON")
}

fn cmd_run(
    config: &EngineConfig,
    program: &Path,
    input: Value,
    options: &RunOptions,
    trusted_blocks: bool,
    full: bool,
) -> Result<i32> {
    let mut policy = config.sandbox_policy();
    policy.trusted |= trusted_blocks;
    let worker = match WorkerCommand::current_exe() {
        Ok(worker) => worker,
        Err(err) => return report(&err),
    };
    let stats: Arc<dyn StatsSink> = if config.stats.enabled {
        Arc::new(JsonlStatsStore::new(config.stats.path.clone()))
    } else {
        Arc::new(NullStats)
    };
    let engine = Engine::with_env_credentials(
        Arc::new(ProgramCache::default()),
        Arc::new(CommandModel::new(
            config.backend.command.clone(),
            config.backend.output_limit_bytes,
        )),
        stats,
        Arc::new(BlockRunner::new(worker, policy)),
    );

    let cancel = CancelToken::new();
    if let Err(err) = cancel_on_signal(cancel.clone()) {
        warn!(err = %err, "signal handling unavailable");
    }
    match engine.run_path(program, input, options, &cancel) {
        Ok(result) if full => print_json(&result),
        Ok(result) => print_json(&result.output),
        Err(err) => report(&err),
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM so supervised children are killed
/// before the process exits.
#[cfg(unix)]
fn cancel_on_signal(cancel: CancelToken) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let runtime = Builder::new_current_thread().enable_all().build()?;
    let (mut interrupt, mut terminate) = {
        let _context = runtime.enter();
        (
            signal(SignalKind::interrupt())?,
            signal(SignalKind::terminate())?,
        )
    };
    thread::spawn(move || {
        runtime.block_on(async {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
        });
        warn!("signal received, cancelling run");
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn cancel_on_signal(cancel: CancelToken) -> io::Result<()> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    thread::spawn(move || {
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            warn!("ctrl-c received, cancelling run");
            cancel.cancel();
        }
    });
    Ok(())
}

fn cmd_check(program: &Path) -> Result<i32> {
    let cache = ProgramCache::default();
    match resolve(&cache, program) {
        Ok(graph) => {
            let order: Vec<String> = graph
                .order_paths()
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            print_json(&json!({
                "program": graph.root_program().name,
                "execution_order": order,
            }))
        }
        Err(err) => report(&err),
    }
}

fn cmd_stats(config: &EngineConfig, program: &Path, model: Option<&str>) -> Result<i32> {
    let loaded = match ProgramCache::default().load(program) {
        Ok(loaded) => loaded,
        Err(err) => return report(&err),
    };
    let store = JsonlStatsStore::new(config.stats.path.clone());
    let key = loaded.path.display().to_string();
    let dependencies: Vec<String> = loaded
        .uses
        .iter()
        .map(|spec| spec.path.display().to_string())
        .collect();
    let summary = store.aggregate(&key, model)?;
    let estimate = estimate_latency_ms(&store, &key, &dependencies, model)?;
    print_json(&json!({
        "summary": summary,
        "latency_estimate": estimate,
    }))
}

fn print_json<T: Serialize>(value: &T) -> Result<i32> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize output")?;
    payload.push('\n');
    io::stdout()
        .write_all(payload.as_bytes())
        .context("write stdout")?;
    Ok(exit_codes::OK)
}

fn report(err: &RunError) -> Result<i32> {
    let payload = serde_json::to_string_pretty(err.payload()).context("serialize error")?;
    eprintln!("{payload}");
    Ok(exit_codes::RUN_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "runllm",
            "run",
            "app.rllm",
            "--input",
            r#"{"text":"hi"}"#,
            "--max-retries",
            "0",
            "--model",
            "ollama/llama3",
            "--trusted-blocks",
        ]);
        let Command::Run {
            program,
            input,
            max_retries,
            model,
            trusted_blocks,
            full,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(program, PathBuf::from("app.rllm"));
        assert_eq!(input.as_deref(), Some(r#"{"text":"hi"}"#));
        assert_eq!(max_retries, Some(0));
        assert_eq!(model.as_deref(), Some("ollama/llama3"));
        assert!(trusted_blocks);
        assert!(!full);
        assert_eq!(cli.config, PathBuf::from("runllm.toml"));
    }

    #[test]
    fn input_and_input_file_conflict() {
        let parsed = Cli::try_parse_from([
            "runllm",
            "run",
            "app.rllm",
            "--input",
            "{}",
            "--input-file",
            "in.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_hidden_worker() {
        let cli = Cli::parse_from(["runllm", "block-worker"]);
        assert!(matches!(cli.command, Command::BlockWorker));
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut options = RunOptions::default();
        apply_overrides(&mut options, Some(0), Some("m".to_string()));
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.model_override.as_deref(), Some("m"));

        let mut untouched = RunOptions {
            model_override: Some("keep".to_string()),
            ..RunOptions::default()
        };
        apply_overrides(&mut untouched, None, None);
        assert_eq!(untouched.max_retries, 2);
        assert_eq!(untouched.model_override.as_deref(), Some("keep"));
    }

    #[test]
    fn input_defaults_to_empty_object() {
        assert_eq!(read_input(None, None).expect("default"), json!({}));
        assert_eq!(
            read_input(Some(r#"{"a":1}"#), None).expect("inline"),
            json!({"a": 1})
        );
        assert!(read_input(Some("nope"), None).is_err());
    }
}
