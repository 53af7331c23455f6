use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

const SMALL_RUN: [&str; 16] = [
    "--agents",
    "2",
    "--max-episode-length",
    "4",
    "--local-steps",
    "2",
    "--global-steps",
    "2",
    "--map-size-cm",
    "200",
    "--resolution",
    "5",
    "--downscaling",
    "2",
    "--view-size",
    "5",
];

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("multislam").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Multi-agent exploration training"));
}

#[test]
fn test_show_config_applies_overrides() {
    let mut cmd = Command::cargo_bin("multislam").unwrap();
    let output = cmd
        .args(["show-config", "--agents", "3", "--exp-name", "trial"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["num_agents"], 3);
    assert_eq!(config["exp_name"], "trial");
    assert_eq!(config["num_local_steps"], 25);
}

#[test]
fn test_show_config_reads_json_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.json");
    std::fs::write(&path, r#"{"num_agents": 4, "gamma": 0.9}"#).unwrap();

    let mut cmd = Command::cargo_bin("multislam").unwrap();
    cmd.arg("show-config")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"num_agents\": 4"));
}

#[test]
fn test_invalid_config_fails() {
    let mut cmd = Command::cargo_bin("multislam").unwrap();
    cmd.args(["show-config", "--agents", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("num_agents must be positive"));
}

#[test]
fn test_cli_eval_writes_report() {
    let dir = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("multislam").unwrap();
    cmd.arg("eval")
        .args(SMALL_RUN)
        .args(["--episodes", "1", "--exp-name", "cli", "--no-progress"])
        .arg("--dump-location")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Starting evaluation"))
        .stdout(predicate::str::contains("Final Exp Area:"));

    let dump = dir.path().join("dump").join("cli");
    assert!(dump.join("explored_area.txt").exists());
    assert!(dump.join("explored_ratio.txt").exists());
}

#[test]
fn test_cli_train_saves_snapshots() {
    let dir = tempdir().unwrap();
    let mut cmd = Command::cargo_bin("multislam").unwrap();
    cmd.arg("train")
        .args(SMALL_RUN)
        .args(["--episodes", "1", "--exp-name", "cli", "--no-progress"])
        .arg("--dump-location")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Run finished"));

    let dump = dir.path().join("dump").join("cli");
    assert!(dump.join("periodic_0.slam").exists());
    assert!(dump.join("periodic_0.multi_global").exists());
}
