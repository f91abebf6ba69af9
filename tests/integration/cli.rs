#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::write_config;
use predicates::boolean::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn check_prints_effective_settings() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(
        temp.path(),
        r#"version: "1"
server:
  name: edge
  listen: "127.0.0.1:9000"
dispatcher:
  workers: 6
  stop_policy: abandon
"#,
    );

    Command::new(assert_cmd::cargo::cargo_bin!("subsysd"))
        .arg("check")
        .arg("-c")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(
            contains("server: edge on 127.0.0.1:9000")
                .and(contains("workers: 6"))
                .and(contains("stop_policy: abandon"))
                .and(contains("queue_capacity: unbounded")),
        );
}

#[test]
fn check_uses_the_default_file_name() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "version: \"1\"\n");

    Command::new(assert_cmd::cargo::cargo_bin!("subsysd"))
        .current_dir(temp.path())
        .arg("check")
        .assert()
        .success()
        .stdout(contains("workers: 4"));
}

#[test]
fn check_rejects_an_invalid_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = write_config(
        temp.path(),
        r#"version: "1"
dispatcher:
  workers: 0
"#,
    );

    Command::new(assert_cmd::cargo::cargo_bin!("subsysd"))
        .arg("check")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(contains("at least one worker"));
}

#[test]
fn missing_config_file_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");

    Command::new(assert_cmd::cargo::cargo_bin!("subsysd"))
        .current_dir(temp.path())
        .args(["--log-level", "off", "check", "-c", "absent.yaml"])
        .assert()
        .failure()
        .stderr(contains("absent.yaml"));
}

#[test]
fn invalid_log_level_is_a_usage_error() {
    Command::new(assert_cmd::cargo::cargo_bin!("subsysd"))
        .args(["--log-level", "loud", "check"])
        .assert()
        .code(2)
        .stderr(contains("invalid log level"));
}
