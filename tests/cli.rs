use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

const VALID: &str = r#"
name = "cli-smoke"
congestion_controls = ["cubic", "olia"]

[[schedulers]]
name = "ECFScheduler"

[[schedulers]]
name = "FALCONScheduler"
params = { debug = true, continue_train = 1 }

[topology]
type = "local"
client = { name = "h1", namespace = "h1" }
server = { name = "h2", namespace = "h2" }

[test]
num_iterations = 3
file_sizes = ["64K", "10M"]
checkpoint = true
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn bench() -> Command {
    Command::cargo_bin("mptcp-bench").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    bench()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("link-test"))
        .stdout(predicate::str::contains("payload"));
}

#[test]
fn test_validate_accepts_good_config() {
    let file = config_file(VALID);

    bench()
        .args(["validate", "-c"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Schedulers: ECFScheduler, FALCONScheduler"))
        .stdout(predicate::str::contains("Tests: 8"));
}

#[test]
fn test_validate_rejects_unknown_scheduler() {
    let file = config_file(&VALID.replace("ECFScheduler", "WarpScheduler"));

    bench()
        .args(["validate", "-c"])
        .arg(file.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unsupported scheduler: WarpScheduler"));
}

#[test]
fn test_validate_rejects_bad_file_size() {
    let file = config_file(&VALID.replace("\"10M\"", "\"10T\""));

    bench()
        .args(["validate", "-c"])
        .arg(file.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_validate_missing_file() {
    bench()
        .args(["validate", "-c", "/nonexistent/mptcp-bench.toml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_summary_without_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = config_file(&format!(
        "{}\n[results]\ndir = '{}'\n",
        VALID,
        dir.path().display()
    ));

    bench()
        .args(["summary", "-c"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No results recorded yet"));
}
