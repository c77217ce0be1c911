//! Operator-surface contracts: verb set, stable output tokens, and the
//! documented exit codes. These run the built `agentos` binary against a
//! temporary state root.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn agentos_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_agentos"))
}

fn agentos(data_dir: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(agentos_path());
    command.arg("--data-dir").arg(data_dir);
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run agentos {args:?}: {err}"),
    }
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn extract_run_id(stdout: &str) -> Option<String> {
    for token in stdout.split_whitespace() {
        if let Some(raw) = token.strip_prefix("run_id=") {
            return Some(raw.to_string());
        }
    }
    None
}

fn must_tempdir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("failed to create temp dir: {err}"),
    }
}

#[test]
fn help_lists_the_stable_verbs() {
    let output = match Command::new(agentos_path()).arg("--help").output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run help: {err}"),
    };
    assert!(output.status.success());
    let stdout = stdout_text(&output);
    for verb in [
        "submit", "status", "inspect", "observe", "recommend", "feedback", "policy", "services",
        "diagnose", "pipeline",
    ] {
        assert!(stdout.contains(verb), "help output missing verb '{verb}'");
    }
}

#[test]
fn unknown_verb_is_a_usage_error() {
    let dir = must_tempdir();
    let output = agentos(dir.path(), &["frobnicate"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn submit_presentation_succeeds_and_status_round_trips() {
    let dir = must_tempdir();
    let output = agentos(
        dir.path(),
        &["submit", "请生成本季度增长复盘框架", "--profile", "adaptive"],
    );
    let stdout = stdout_text(&output);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("outcome=succeeded"), "stdout: {stdout}");
    assert!(stdout.contains("strategy=mckinsey-ppt"), "stdout: {stdout}");
    let run_id = extract_run_id(&stdout).unwrap_or_else(|| panic!("no run_id in: {stdout}"));

    let status = agentos(dir.path(), &["status", &run_id]);
    assert_eq!(status.status.code(), Some(0));
    let body = stdout_text(&status);
    assert!(body.contains("\"outcome\": \"succeeded\""), "status: {body}");

    let inspect = agentos(dir.path(), &["inspect", &run_id]);
    assert_eq!(inspect.status.code(), Some(0));
    let body = stdout_text(&inspect);
    assert!(body.contains("\"attempts\""));
    assert!(body.contains("mckinsey-ppt"));
}

#[test]
fn secret_parameter_exits_with_policy_violation_code() {
    let dir = must_tempdir();
    let output = agentos(
        dir.path(),
        &[
            "submit",
            "请生成本季度增长复盘框架",
            "--profile",
            "adaptive",
            "--param",
            "token=sk-live-abcdef",
        ],
    );
    assert_eq!(output.status.code(), Some(14));
}

#[test]
fn dry_run_submit_prints_plan_without_executing() {
    let dir = must_tempdir();
    let output = agentos(
        dir.path(),
        &["--dry-run", "submit", "请生成本季度增长复盘框架"],
    );
    assert_eq!(output.status.code(), Some(0));
    let stdout = stdout_text(&output);
    assert!(stdout.contains("\"mode\": \"dry-run\""));
    assert!(stdout.contains("mckinsey-ppt"));
    assert!(extract_run_id(&stdout).is_none());
}

#[test]
fn feedback_add_then_stats_counts_it() {
    let dir = must_tempdir();
    let submit = agentos(
        dir.path(),
        &["submit", "请生成本季度增长复盘框架", "--profile", "adaptive"],
    );
    let run_id = extract_run_id(&stdout_text(&submit))
        .unwrap_or_else(|| panic!("submit produced no run_id"));

    let add = agentos(
        dir.path(),
        &["feedback", "add", &run_id, "--rating", "1", "--note", "clean"],
    );
    assert_eq!(add.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&add.stderr));
    assert!(stdout_text(&add).contains("feedback_id="));

    let stats = agentos(dir.path(), &["feedback", "stats"]);
    assert_eq!(stats.status.code(), Some(0));
    let body = stdout_text(&stats);
    assert!(body.contains("\"total\": 1"));
    assert!(body.contains("\"positive\": 1"));
}

#[test]
fn policy_show_starts_empty_and_apply_creates_snapshot() {
    let dir = must_tempdir();
    let show = agentos(dir.path(), &["policy", "show"]);
    assert_eq!(show.status.code(), Some(0));
    assert!(stdout_text(&show).contains("\"active\": []"));

    let overrides = dir.path().join("overrides.json");
    match std::fs::write(
        &overrides,
        r#"[{"scope": "strategy", "key": "data-query", "value": "blocked"}]"#,
    ) {
        Ok(()) => {}
        Err(err) => panic!("failed to write override file: {err}"),
    }
    let file_arg = overrides.display().to_string();
    let apply = agentos(dir.path(), &["policy", "apply", "--file", &file_arg]);
    assert_eq!(apply.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&apply.stderr));
    assert!(stdout_text(&apply).contains("snapshot_id"));

    let show = agentos(dir.path(), &["policy", "show"]);
    assert!(stdout_text(&show).contains("data-query"));
}

#[test]
fn diagnose_is_healthy_on_a_fresh_root() {
    let dir = must_tempdir();
    let output = agentos(dir.path(), &["diagnose"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout_text(&output).contains("\"ok\": true"));
}

#[test]
fn pipeline_dry_run_previews_steps() {
    let dir = must_tempdir();
    let pipeline = dir.path().join("pipe.yaml");
    match std::fs::write(
        &pipeline,
        "name: demo\nsteps:\n  - service: sequential-thinking/think\n    params:\n      problem: split this\n",
    ) {
        Ok(()) => {}
        Err(err) => panic!("failed to write pipeline: {err}"),
    }
    let file_arg = pipeline.display().to_string();
    let output = agentos(dir.path(), &["--dry-run", "pipeline", &file_arg]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let body = stdout_text(&output);
    assert!(body.contains("\"ok\": true"));
    assert!(body.contains("pipeline_id"));
}

#[test]
fn observe_reports_slo_block() {
    let dir = must_tempdir();
    let _ = agentos(
        dir.path(),
        &["submit", "请生成本季度增长复盘框架", "--profile", "adaptive"],
    );
    let output = agentos(dir.path(), &["observe", "--days", "7"]);
    assert_eq!(output.status.code(), Some(0));
    let body = stdout_text(&output);
    assert!(body.contains("\"slo\""));
    assert!(body.contains("\"run_success_rate\""));
}
