//! Transform blocks executed through the real `block-worker` process.
//!
//! These spawn the `runllm` binary, so limits (timeout, memory, cancellation)
//! are enforced by killing an actual child process.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use runllm::cancel::CancelToken;
use runllm::engine::{Engine, RunOptions};
use runllm::error::ErrorCode;
use runllm::io::credentials::StaticCredentials;
use runllm::io::program::ProgramCache;
use runllm::io::sandbox::{BlockExecutor, BlockRunner, SandboxPolicy, WorkerCommand};
use runllm::io::worker::BlockStage;
use runllm::test_support::{ProgramFixture, RecordingStats, ScriptedModel, fixture_source};

fn runner(policy: SandboxPolicy) -> BlockRunner {
    BlockRunner::new(WorkerCommand::binary(env!("CARGO_BIN_EXE_runllm")), policy)
}

fn run(runner: &BlockRunner, source: &str, context: Value) -> runllm::error::RunResult<Value> {
    runner
        .run(BlockStage::Pre, source, &context, &CancelToken::new())
        .map(Value::Object)
}

#[test]
fn worker_returns_patch_from_context() {
    let patch = run(
        &runner(SandboxPolicy::default()),
        "result = { shout: context.input.text.toUpperCase(), n: context.uses.a.n + 1 };",
        json!({"input": {"text": "abc"}, "uses": {"a": {"n": 1}}}),
    )
    .expect("patch");
    assert_eq!(patch, json!({"shout": "ABC", "n": 2}));
}

#[test]
fn empty_result_means_no_change() {
    let patch = run(&runner(SandboxPolicy::default()), "var unused = 1;", json!({}))
        .expect("empty");
    assert_eq!(patch, json!({}));
}

#[test]
fn infinite_loop_is_killed_at_timeout() {
    let policy = SandboxPolicy {
        timeout: Duration::from_millis(500),
        ..SandboxPolicy::default()
    };
    let started = Instant::now();
    let err = run(&runner(policy), "while (true) {}", json!({})).expect_err("timeout");
    assert_eq!(err.code(), ErrorCode::BlockExecutionFailure);
    assert!(
        err.payload().details["reason"]
            .as_str()
            .is_some_and(|reason| reason.contains("timed out"))
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn trusted_blocks_keep_the_timeout() {
    let policy = SandboxPolicy {
        trusted: true,
        timeout: Duration::from_millis(500),
        ..SandboxPolicy::default()
    };
    let err = run(&runner(policy), "for (;;) {}", json!({})).expect_err("timeout");
    assert_eq!(err.code(), ErrorCode::BlockExecutionFailure);
    assert_eq!(err.payload().details["trusted"], true);
}

#[cfg(target_os = "linux")]
#[test]
fn memory_ceiling_kills_untrusted_worker() {
    let policy = SandboxPolicy {
        timeout: Duration::from_secs(30),
        memory_limit_mb: 64,
        ..SandboxPolicy::default()
    };
    let source = "var hoard = []; while (true) { hoard.push(new Array(100000).fill(1)); }";
    let err = run(&runner(policy), source, json!({})).expect_err("memory");
    assert_eq!(err.code(), ErrorCode::BlockExecutionFailure);
    assert!(
        err.payload().details["reason"]
            .as_str()
            .is_some_and(|reason| reason.contains("memory limit"))
    );
}

#[test]
fn untrusted_blocks_lose_ambient_capabilities() {
    let patch = run(
        &runner(SandboxPolicy::default()),
        "result = { fn: typeof Function, ev: typeof eval, env: typeof env, json: typeof JSON };",
        json!({}),
    )
    .expect("patch");
    assert_eq!(
        patch,
        json!({"fn": "undefined", "ev": "undefined", "env": "undefined", "json": "object"})
    );
}

#[test]
fn trusted_blocks_see_environment() {
    let policy = SandboxPolicy {
        trusted: true,
        ..SandboxPolicy::default()
    };
    let patch = run(
        &runner(policy),
        "result = { env: typeof env, fn: typeof Function };",
        json!({}),
    )
    .expect("patch");
    assert_eq!(patch, json!({"env": "object", "fn": "function"}));
}

#[test]
fn thrown_error_is_block_failure() {
    let err = run(
        &runner(SandboxPolicy::default()),
        "throw new TypeError('nope');",
        json!({}),
    )
    .expect_err("throw");
    assert_eq!(err.code(), ErrorCode::BlockExecutionFailure);
    assert!(!err.is_retryable());
}

#[test]
fn cancellation_kills_running_worker() {
    let runner = runner(SandboxPolicy {
        timeout: Duration::from_secs(30),
        ..SandboxPolicy::default()
    });
    let cancel = CancelToken::new();
    let started = Instant::now();
    let result = thread::scope(|scope| {
        let handle = scope.spawn(|| runner.run(BlockStage::Post, "while (true) {}", &json!({}), &cancel));
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        handle.join().expect("join")
    });
    let err = result.expect_err("cancelled");
    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn engine_runs_blocks_through_worker() {
    let fixture = ProgramFixture::new();
    let body = "Say {{shout}}\n```rllm-js pre\nresult = { shout: context.input.text.toUpperCase() };\n```\n```rllm-js post\nresult = { length: context.output.summary.length };\n```";
    let path = fixture.write("blocks.rllm", &fixture_source("blocks", body));
    let model = Arc::new(ScriptedModel::always(r#"{"summary":"done"}"#));
    let engine = Engine::new(
        Arc::new(ProgramCache::default()),
        Arc::clone(&model) as Arc<dyn runllm::io::model::ModelBackend>,
        Arc::new(RecordingStats::default()),
        Arc::new(runner(SandboxPolicy::default())),
        Arc::new(StaticCredentials::default().with("OPENAI_API_KEY", "sk-test")),
    );

    let result = engine
        .run_path(&path, json!({"text": "abc"}), &RunOptions::default(), &CancelToken::new())
        .expect("run");
    assert!(model.prompts()[0].starts_with("Say ABC"));
    assert_eq!(result.output, json!({"summary": "done", "length": 4}));
}
