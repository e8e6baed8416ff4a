//! CLI tests: spawn the `runllm` binary and check exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use runllm::exit_codes;
use runllm::test_support::{ProgramFixture, fixture_source, with_uses};

fn runllm(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runllm"))
        .current_dir(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn runllm")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

fn stderr_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stderr).expect("stderr json")
}

#[test]
fn check_prints_children_first() {
    let fixture = ProgramFixture::new();
    fixture.write("child.rllm", &fixture_source("child", "Child"));
    fixture.write(
        "parent.rllm",
        &with_uses(&fixture_source("parent", "Parent"), &[("c", "child.rllm", "{ text: x }")]),
    );

    let output = runllm(fixture.dir(), &["check", "parent.rllm"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["program"], "parent");
    let order = report["execution_order"].as_array().expect("order");
    assert_eq!(order.len(), 2);
    assert!(order[0].as_str().is_some_and(|p| p.ends_with("child.rllm")));
}

#[test]
fn check_reports_cycle_payload() {
    let fixture = ProgramFixture::new();
    fixture.write(
        "a.rllm",
        &with_uses(&fixture_source("a", "A"), &[("b", "b.rllm", "{}")]),
    );
    fixture.write(
        "b.rllm",
        &with_uses(&fixture_source("b", "B"), &[("a", "a.rllm", "{}")]),
    );

    let output = runllm(fixture.dir(), &["check", "a.rllm"]);
    assert_eq!(output.status.code(), Some(exit_codes::RUN_FAILED));
    let payload = stderr_json(&output);
    assert_eq!(payload["error_code"], "dependency-cycle");
    assert_eq!(payload["doc_ref"], "docs/errors.md#dependency-cycle");
    assert!(output.stdout.is_empty());
}

#[test]
fn invalid_input_json_is_usage_error() {
    let fixture = ProgramFixture::new();
    fixture.write("app.rllm", &fixture_source("app", "Body"));
    let output = runllm(fixture.dir(), &["run", "app.rllm", "--input", "{not json"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn bad_config_is_usage_error() {
    let fixture = ProgramFixture::new();
    fixture.write("app.rllm", &fixture_source("app", "Body"));
    fs::write(fixture.dir().join("runllm.toml"), "model_timeout_secs = 0\n").expect("config");
    let output = runllm(fixture.dir(), &["check", "app.rllm"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
#[test]
fn run_then_stats_through_bridge() {
    let fixture = ProgramFixture::new();
    fixture.write("app.rllm", &fixture_source("app", "Summarize {{input.text}}"));
    let bridge = fixture.write(
        "bridge.sh",
        "cat >/dev/null\nprintf '%s' '{\"text\":\"{\\\"summary\\\":\\\"ok\\\"}\",\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}'\n",
    );
    let config = format!(
        "[backend]\ncommand = [\"sh\", \"{}\"]\n\n[stats]\npath = \"stats.jsonl\"\n",
        bridge.display()
    );
    fs::write(fixture.dir().join("runllm.toml"), config).expect("config");

    let output = runllm(
        fixture.dir(),
        &["run", "app.rllm", "--input", r#"{"text":"abc"}"#, "--model", "ollama/llama3"],
    );
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(stdout_json(&output), serde_json::json!({"summary": "ok"}));

    let output = runllm(fixture.dir(), &["stats", "app.rllm"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["summary"]["total_runs"], 1);
    assert_eq!(report["summary"]["total_tokens"], 5);
    assert_eq!(report["latency_estimate"]["dependency_count"], 0);
}

#[cfg(unix)]
#[test]
fn sigterm_cancels_in_flight_bridge() {
    let fixture = ProgramFixture::new();
    fixture.write("app.rllm", &fixture_source("app", "Summarize {{input.text}}"));
    let bridge = fixture.write("bridge.sh", "cat >/dev/null\ntouch started\nexec sleep 30\n");
    let config = format!(
        "[backend]\ncommand = [\"sh\", \"{}\"]\n\n[stats]\nenabled = false\n",
        bridge.display()
    );
    fs::write(fixture.dir().join("runllm.toml"), config).expect("config");

    let child = Command::new(env!("CARGO_BIN_EXE_runllm"))
        .current_dir(fixture.dir())
        .args(["run", "app.rllm", "--input", r#"{"text":"abc"}"#, "--model", "ollama/llama3"])
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn runllm");

    let started = fixture.dir().join("started");
    let deadline = Instant::now() + Duration::from_secs(20);
    while !started.exists() {
        assert!(Instant::now() < deadline, "bridge never started");
        thread::sleep(Duration::from_millis(20));
    }

    let signalled = Instant::now();
    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("send SIGTERM");
    assert!(status.success());
    let output = child.wait_with_output().expect("wait runllm");
    assert!(signalled.elapsed() < Duration::from_secs(15));
    assert_eq!(output.status.code(), Some(exit_codes::RUN_FAILED));
    assert_eq!(stderr_json(&output)["error_code"], "cancelled");
}

#[test]
fn missing_credential_prints_payload() {
    let fixture = ProgramFixture::new();
    fixture.write("app.rllm", &fixture_source("app", "Summarize"));
    let output = Command::new(env!("CARGO_BIN_EXE_runllm"))
        .current_dir(fixture.dir())
        .args(["run", "app.rllm", "--input", r#"{"text":"abc"}"#])
        .env_remove("OPENAI_API_KEY")
        .output()
        .expect("spawn runllm");
    assert_eq!(output.status.code(), Some(exit_codes::RUN_FAILED));
    let payload = stderr_json(&output);
    assert_eq!(payload["error_code"], "missing-credential");
    assert_eq!(payload["details"]["missing_env_var"], "OPENAI_API_KEY");
}
