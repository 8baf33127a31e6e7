//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

const REQUIREMENTS: &str = r#"
project: shop
features:
  - description: "REST API for orders"
    priority: critical
  - description: "Checkout page"
    priority: important
    depends_on: [REQ-001]
technical:
  - "Orders table schema"
"#;

const CYCLIC: &str = r#"
features:
  - description: "Orders API"
    depends_on: [REQ-002]
  - description: "Orders page"
    depends_on: [REQ-001]
"#;

const INVALID: &str = r#"
features:
  - description: ""
  - description: "Checkout page"
    priority: urgent
    depends_on: [REQ-009]
"#;

/// Get the binary to test.
fn agentrun() -> Command {
    let mut cmd = Command::cargo_bin("agentrun").unwrap();
    cmd.env_remove("AGENTRUN_CONFIG").env_remove("AGENTRUN_MAX_PARALLEL").env_remove("RUST_LOG");
    cmd
}

/// A scratch directory with an empty local config, so user config never leaks in.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    dir.child("agentrun.toml").write_str("").unwrap();
    dir
}

fn write(dir: &TempDir, name: &str, content: &str) {
    dir.child(name).write_str(content).unwrap();
}

/// Run the sample workflow and return the checkpoint path.
fn run_sample(dir: &TempDir) -> std::path::PathBuf {
    write(dir, "requirements.yaml", REQUIREMENTS);
    agentrun()
        .current_dir(dir.path())
        .args(["run", "requirements.yaml", "--no-history", "--checkpoint-dir", "checkpoints", "-o", "out"])
        .assert()
        .success();
    dir.path().join("checkpoints").join("checkpoint.json")
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    agentrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow orchestration"));
}

#[test]
fn test_version_flag() {
    agentrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_run_help_lists_resume_flag() {
    agentrun()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--resume-from-checkpoint"))
        .stdout(predicate::str::contains("--max-parallel"));
}

#[test]
fn test_run_requires_requirements_or_checkpoint() {
    agentrun().arg("run").assert().failure();
}

// ============================================================================
// Validate & Plan Tests
// ============================================================================

#[test]
fn test_validate_accepts_good_document() {
    let dir = workspace();
    write(&dir, "requirements.yaml", REQUIREMENTS);

    agentrun()
        .current_dir(dir.path())
        .args(["validate", "requirements.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid: 3 requirements"));
}

#[test]
fn test_validate_reports_every_violation() {
    let dir = workspace();
    write(&dir, "requirements.yaml", INVALID);

    agentrun()
        .current_dir(dir.path())
        .args(["validate", "requirements.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid requirement document (3 problems)"))
        .stderr(predicate::str::contains("unknown priority 'urgent'"))
        .stderr(predicate::str::contains("unknown requirement id 'REQ-009'"));
}

#[test]
fn test_validate_rejects_cycle() {
    let dir = workspace();
    write(&dir, "requirements.yaml", CYCLIC);

    agentrun()
        .current_dir(dir.path())
        .args(["validate", "requirements.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Cycle detected"));
}

#[test]
fn test_validate_missing_file() {
    let dir = workspace();
    agentrun().current_dir(dir.path()).args(["validate", "nope.yaml"]).assert().code(1);
}

#[test]
fn test_plan_text_lists_waves() {
    let dir = workspace();
    write(&dir, "requirements.yaml", REQUIREMENTS);

    agentrun()
        .current_dir(dir.path())
        .args(["plan", "requirements.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("REQ-002 [important]"))
        .stdout(predicate::str::contains("after REQ-001"))
        .stdout(predicate::str::contains("wave 1:"));
}

#[test]
fn test_plan_json_is_parseable() {
    let dir = workspace();
    write(&dir, "requirements.json", r#"{"features": ["Orders API"], "technical": ["Schema"]}"#);

    let output = agentrun()
        .current_dir(dir.path())
        .args(["plan", "requirements.json", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["requirements"].as_array().unwrap().len(), 2);
    assert!(!plan["tasks"].as_array().unwrap().is_empty());
}

// ============================================================================
// Run & Inspect Tests
// ============================================================================

#[test]
fn test_run_simulated_writes_report() {
    let dir = workspace();
    let checkpoint = run_sample(&dir);

    dir.child("out/report.json").assert(predicate::path::exists());
    assert!(checkpoint.exists());

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("out/report.json")).unwrap()).unwrap();
    assert_eq!(report["overall_status"], "succeeded");
}

#[test]
fn test_run_json_output() {
    let dir = workspace();
    write(&dir, "requirements.yaml", REQUIREMENTS);

    agentrun()
        .current_dir(dir.path())
        .args(["run", "requirements.yaml", "--no-history", "--checkpoint-dir", "cp", "-o", "out", "-f", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"overall_status\": \"succeeded\""));
}

#[test]
fn test_run_rejects_zero_parallelism() {
    let dir = workspace();
    write(&dir, "requirements.yaml", REQUIREMENTS);

    agentrun()
        .current_dir(dir.path())
        .args(["run", "requirements.yaml", "--no-history", "-p", "0", "-o", "out"])
        .assert()
        .code(1);
}

#[test]
fn test_resume_finished_checkpoint() {
    let dir = workspace();
    let checkpoint = run_sample(&dir);

    agentrun()
        .current_dir(dir.path())
        .args(["run", "--no-history", "-o", "resumed", "--resume-from-checkpoint"])
        .arg(&checkpoint)
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCEEDED"));
}

#[test]
fn test_inspect_checkpoint() {
    let dir = workspace();
    let checkpoint = run_sample(&dir);

    agentrun()
        .current_dir(dir.path())
        .arg("inspect")
        .arg(&checkpoint)
        .assert()
        .success()
        .stdout(predicate::str::contains("schema 1.0"))
        .stdout(predicate::str::contains("REQ-001"));
}

#[test]
fn test_inspect_rejects_garbage() {
    let dir = workspace();
    write(&dir, "checkpoint.json", "{not json");

    agentrun()
        .current_dir(dir.path())
        .args(["inspect", "checkpoint.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("corrupt"));
}

// ============================================================================
// Completions Tests
// ============================================================================

#[test]
fn test_completions_bash() {
    agentrun()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("agentrun"));
}

#[test]
fn test_completions_invalid_shell() {
    agentrun().args(["completions", "invalid-shell"]).assert().failure();
}
