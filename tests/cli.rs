use assert_cmd::Command;
use predicates::prelude::*;

fn luksrku() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("luksrku").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    luksrku().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    luksrku()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("luksrku"));
}

#[test]
fn test_no_args_shows_usage() {
    luksrku()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    luksrku()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = luksrku().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["client", "server", "edit"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_client_help() {
    luksrku()
        .args(["client", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-luks"))
        .stdout(predicate::str::contains("23170"));
}

#[test]
fn test_server_help() {
    luksrku()
        .args(["server", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--silent"));
}

#[test]
fn test_edit_help() {
    luksrku()
        .args(["edit", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("interactively"));
}

#[test]
fn test_client_requires_filename() {
    luksrku()
        .arg("client")
        .assert()
        .failure()
        .stderr(predicate::str::contains("FILENAME"));
}

#[test]
fn test_server_requires_filename() {
    luksrku()
        .arg("server")
        .assert()
        .failure()
        .stderr(predicate::str::contains("FILENAME"));
}

#[test]
fn test_client_rejects_bad_timeout() {
    luksrku()
        .args(["client", "-t", "soon", "db.luksrku"])
        .assert()
        .failure();
}

#[test]
fn test_edit_quits_on_eof() {
    luksrku()
        .arg("edit")
        .write_stdin("")
        .assert()
        .success();
}

#[test]
fn test_edit_reports_unknown_command() {
    luksrku()
        .arg("edit")
        .write_stdin("frobnicate\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("No such command"));
}

#[test]
fn test_edit_help_lists_commands() {
    let assert = luksrku()
        .arg("edit")
        .write_stdin("help\n")
        .assert()
        .success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    for cmd in [
        "add_host",
        "del_host",
        "rekey_host",
        "host_param",
        "add_volume",
        "del_volume",
        "rekey_volume",
        "showkey_volume",
        "flag_volume",
        "export",
        "save",
    ] {
        assert!(output.contains(cmd), "help should list '{}'", cmd);
    }
}

#[test]
fn test_edit_add_host_and_list() {
    luksrku()
        .arg("edit")
        .write_stdin("add_host alpha\nlist\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("server database"))
        .stdout(predicate::str::contains("\"alpha\""));
}
