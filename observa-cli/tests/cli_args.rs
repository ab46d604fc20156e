//! Binary smoke tests for argument surface.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_all_subcommands() {
    Command::cargo_bin("observa")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("stop"));
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("observa")
        .expect("binary")
        .arg("mirror")
        .assert()
        .failure();
}

#[test]
fn run_rejects_missing_config_value() {
    Command::cargo_bin("observa")
        .expect("binary")
        .args(["run", "--config"])
        .assert()
        .failure();
}
