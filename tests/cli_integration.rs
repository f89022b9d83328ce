//! Integration tests for the trellis CLI
//!
//! These tests exercise the full CLI workflow using a temporary database.
//! They verify that commands work end-to-end without mocking.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Helper to run trellis CLI with a specific database path
fn run_trellis(args: &[&str], db_path: &PathBuf) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_trellis"))
        .args(args)
        .env("TRELLIS_DB_PATH", db_path)
        .output()
        .expect("Failed to execute trellis")
}

/// Helper to get stdout as string
fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to get stderr as string
fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn temp_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trellis.db");
    (dir, path)
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_trellis"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("trellis"));
    assert!(out.contains("Progress engine"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_trellis"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("trellis"));
}

// =============================================================================
// Shell Completion Tests
// =============================================================================

#[test]
fn test_completion_zsh() {
    let output = Command::new(env!("CARGO_BIN_EXE_trellis"))
        .args(["completion", "zsh"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion zsh failed: {}",
        stderr(&output)
    );
    let out = stdout(&output);
    assert!(
        out.contains("#compdef trellis"),
        "zsh completion should contain #compdef"
    );
}

#[test]
fn test_completion_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_trellis"))
        .args(["completion", "bash"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion bash failed: {}",
        stderr(&output)
    );
    let out = stdout(&output);
    assert!(
        out.contains("_trellis"),
        "bash completion should contain _trellis function"
    );
}

// =============================================================================
// Workflow Tests
// =============================================================================

/// Seed vision 1 with KPIs 1 (quarterly) → 2 (monthly) → 3 (weekly) → 4 (daily)
fn seed_chain(db_path: &PathBuf) {
    let output = run_trellis(&["vision", "add", "Write a novel"], db_path);
    assert!(output.status.success(), "vision add failed: {}", stderr(&output));

    let steps: [&[&str]; 4] = [
        &["add", "quarterly", "Q1 draft", "--vision", "1"],
        &["add", "monthly", "January", "--vision", "1", "--parent", "1"],
        &["add", "weekly", "Week 1", "--vision", "1", "--parent", "2"],
        &[
            "add", "daily", "Write 500 words", "--vision", "1", "--parent", "3",
            "--date", "2024-01-05",
        ],
    ];
    for args in steps {
        let output = run_trellis(args, db_path);
        assert!(output.status.success(), "add failed: {}", stderr(&output));
    }
}

#[test]
fn test_log_rolls_up_to_the_root() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);

    let output = run_trellis(&["log", "4", "--date", "2024-01-05"], &db_path);
    assert!(output.status.success(), "log failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("100%"));
    assert!(
        out.contains("4 → 3 → 2 → 1"),
        "the whole chain should be recalculated, got: {}",
        out
    );

    let output = run_trellis(&["tree", "1"], &db_path);
    assert!(output.status.success(), "tree failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Write a novel"));
    assert!(out.contains("Q1 draft"));
    assert!(out.contains("completed"));
    assert!(out.contains("4 KPIs"));
}

#[test]
fn test_formula_shows_breakdown() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);
    run_trellis(&["log", "4", "--date", "2024-01-05"], &db_path);

    let output = run_trellis(&["formula", "3"], &db_path);
    assert!(output.status.success(), "formula failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("weighted_rollup"));
    assert!(out.contains("100%"));
    assert!(out.contains("Write 500 words"));
}

#[test]
fn test_formula_before_any_calculation_fails() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);

    let output = run_trellis(&["formula", "1"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not been calculated"));
}

#[test]
fn test_override_and_clear() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);
    run_trellis(&["log", "4", "--date", "2024-01-05"], &db_path);

    let output = run_trellis(
        &["override", "3", "40", "--reason", "counting drafts by hand"],
        &db_path,
    );
    assert!(output.status.success(), "override failed: {}", stderr(&output));

    let output = run_trellis(&["formula", "3"], &db_path);
    let out = stdout(&output);
    assert!(out.contains("manual_override"));
    assert!(out.contains("counting drafts by hand"));

    let output = run_trellis(&["override", "3", "--clear"], &db_path);
    assert!(output.status.success(), "clear failed: {}", stderr(&output));

    let output = run_trellis(&["formula", "3"], &db_path);
    assert!(stdout(&output).contains("weighted_rollup"));
}

#[test]
fn test_invalid_hierarchy_is_a_clear_error() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);

    // A daily KPI directly under a quarterly parent skips two levels
    let output = run_trellis(
        &["add", "daily", "Misplaced", "--vision", "1", "--parent", "1"],
        &db_path,
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid hierarchy"));
}

#[test]
fn test_log_unknown_kpi_fails() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);

    let output = run_trellis(&["log", "99"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("does not exist"));
}

#[test]
fn test_streak_reports_runs() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);

    for day in ["2024-01-01", "2024-01-02", "2024-01-03"] {
        let output = run_trellis(&["log", "4", "--date", day], &db_path);
        assert!(output.status.success(), "log failed: {}", stderr(&output));
    }

    let output = run_trellis(&["streak", "4"], &db_path);
    assert!(output.status.success(), "streak failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("longest: 3"));
    assert!(out.contains("last activity: 2024-01-03"));
}

#[test]
fn test_zombies_quiet_on_fresh_data() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);
    run_trellis(&["log", "4", "--date", "2024-01-05"], &db_path);

    let output = run_trellis(&["zombies", "1"], &db_path);
    assert!(output.status.success(), "zombies failed: {}", stderr(&output));
    assert!(stdout(&output).contains("No zombie goals"));
}

#[test]
fn test_move_between_parents() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);
    let output = run_trellis(&["add", "quarterly", "Q2 revision", "--vision", "1"], &db_path);
    assert!(output.status.success());

    // KPI 5 is the new quarterly; move the monthly under it
    let output = run_trellis(&["move", "2", "--parent", "5"], &db_path);
    assert!(output.status.success(), "move failed: {}", stderr(&output));

    // Moving it under itself is rejected
    let output = run_trellis(&["move", "2", "--parent", "2"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid hierarchy"));
}

#[test]
fn test_rm_recalculates_former_parent() {
    let (_dir, db_path) = temp_db();
    seed_chain(&db_path);
    run_trellis(&["log", "4", "--date", "2024-01-05"], &db_path);

    let output = run_trellis(&["rm", "4"], &db_path);
    assert!(output.status.success(), "rm failed: {}", stderr(&output));

    let output = run_trellis(&["tree", "1"], &db_path);
    let out = stdout(&output);
    assert!(out.contains("3 KPIs"));
    assert!(!out.contains("Write 500 words"));
}
