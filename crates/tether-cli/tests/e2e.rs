//! End-to-end tests for the Tether CLI.
//!
//! These run the `tether` binary against throwaway configuration files.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A temporary application root with a `tether.toml`.
struct TestApp {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl TestApp {
    fn new(config: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config_path = temp_dir.path().join("tether.toml");
        fs::write(&config_path, config).expect("Failed to write config");

        Self {
            temp_dir,
            config_path,
        }
    }

    fn tether(&self) -> Command {
        let mut cmd = Command::cargo_bin("tether").expect("tether binary");
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("--no-color")
            .env_remove("TETHER_CONFIG")
            .current_dir(self.temp_dir.path());
        cmd
    }
}

fn two_workers() -> String {
    r#"
[paths]
secret = "e2e"

[shared_workers.alpha]
expression = "Echo"
eager_start = true

[shared_workers.beta]
address = "tcp://worker.example.com:7000"
class = "Counter"
"#
    .to_string()
}

// =============================================================================
// list
// =============================================================================

#[test]
fn test_long_list_of_empty_registry_is_header_only() {
    let app = TestApp::new("");

    let output = app.tether().args(["list", "--long"]).assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();

    assert!(stdout.contains("Flags legend:"));
    let header = stdout
        .lines()
        .find(|line| line.contains("Network address"))
        .expect("table header");
    for column in ["Flags", "Name", "Factory", "PID", "Status"] {
        assert!(header.contains(column), "missing {} in {:?}", column, header);
    }

    // Only rule lines may follow the header.
    let after_header: Vec<&str> = stdout
        .lines()
        .skip_while(|line| !line.contains("Network address"))
        .skip(1)
        .filter(|line| line.chars().any(|c| c.is_alphanumeric()))
        .collect();
    assert!(after_header.is_empty(), "unexpected rows: {:?}", after_header);
}

#[test]
fn test_plain_list_prints_sorted_names() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .arg("list")
        .assert()
        .success()
        .stdout("alpha\nbeta\n");
}

#[test]
fn test_long_list_shows_flags_and_placeholders() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["list", "-l"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--ake"))
        .stdout(predicate::str::contains("-ra--"))
        .stdout(predicate::str::contains("worker.example.com:7000"))
        .stdout(predicate::str::contains("local-only"))
        .stdout(predicate::str::contains("no data"));
}

#[test]
fn test_list_factory_filter() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["list", "--factory", "nope"])
        .assert()
        .success()
        .stdout("");
}

// =============================================================================
// stop-all
// =============================================================================

#[test]
fn test_stop_all_signal_mode_skips_remote() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["stop-all", "-r", "--signal", "TERM"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Skipped remote worker beta."))
        .stdout(predicate::str::contains(
            "Couldn't send signal to local worker alpha",
        ));
}

#[test]
fn test_stop_all_message_mode_reports_not_running() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["stop-all", "--also-disable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Disabled local worker alpha."))
        .stdout(predicate::str::contains("Local worker alpha was not running."))
        .stdout(predicate::str::contains("Skipped remote worker beta."));

    app.tether()
        .args(["list", "-l", "-x"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--ade"));
}

#[test]
fn test_stop_all_rejects_bad_signal() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["stop-all", "-k", "NOT-A-SIGNAL"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("signal"));
}

// =============================================================================
// Hooks and single-worker commands
// =============================================================================

#[test]
fn test_warm_up_writes_scripts_to_cache() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["warm-up", "--no-start"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Compiled alpha"))
        .stdout(predicate::str::contains("1 eager worker(s) left stopped"));

    let script = app
        .temp_dir
        .path()
        .join("cache/tether/shared_worker.alpha.json");
    assert!(script.exists());
    assert!(
        app.temp_dir
            .path()
            .join("cache/tether/shared_worker.beta.json")
            .exists()
    );
}

#[test]
fn test_compile_prints_descriptor() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["compile", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"start_transport\""))
        .stdout(predicate::str::contains("Echo"));
}

#[test]
fn test_unknown_worker_fails_with_hint() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["status", "gamma"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("hint: run `tether list`"));
}

#[test]
fn test_starting_remote_worker_fails() {
    let app = TestApp::new(&two_workers());

    app.tether()
        .args(["start", "beta"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("remote"));
}

#[test]
fn test_ambiguous_definition_is_rejected() {
    let app = TestApp::new(
        r#"
[shared_workers.both]
expression = "Echo"
class = "Counter"
"#,
    );

    app.tether().arg("list").assert().failure();
}
