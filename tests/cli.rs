use assert_cmd::Command;
use predicates::prelude::*;

fn virtbak() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("virtbak").unwrap()
}

fn write_config(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("config.yml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_exits_successfully() {
    virtbak().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    virtbak()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("virtbak"));
}

#[test]
fn test_no_args_shows_usage() {
    virtbak()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = virtbak().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["backup", "restore", "clean", "list"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_missing_config_fails_with_exit_code_1() {
    virtbak()
        .args(["-c", "/nonexistent/config.yml", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot load configuration"));
}

#[test]
fn test_list_empty_repository() {
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("backups");
    std::fs::create_dir_all(&target).unwrap();
    let config = write_config(
        work.path(),
        &format!(
            "uri: \"test:///default\"\ngroups:\n  main:\n    target: {}\n    hosts: [\"test\"]\n",
            target.display()
        ),
    );

    virtbak()
        .args(["-c", config.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("main"));
}

#[test]
fn test_list_unknown_group_fails() {
    let work = tempfile::tempdir().unwrap();
    let config = write_config(work.path(), "uri: \"test:///default\"\ngroups: {}\n");

    virtbak()
        .args(["-c", config.to_str().unwrap(), "list", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not configured"));
}

#[test]
fn test_clean_empty_repository_reports_zero() {
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("backups");
    std::fs::create_dir_all(&target).unwrap();
    let config = write_config(
        work.path(),
        &format!(
            "uri: \"test:///default\"\ngroups:\n  main:\n    target: {}\n    hosts: [\"test\"]\n",
            target.display()
        ),
    );

    virtbak()
        .args(["-c", config.to_str().unwrap(), "clean"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0 expired backup(s)"));
}

#[test]
fn test_deprecated_compression_keys_warn() {
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("backups");
    std::fs::create_dir_all(&target).unwrap();
    let config = write_config(
        work.path(),
        &format!(
            "uri: \"test:///default\"\ngroups:\n  main:\n    target: {}\n    compression: gz\n    hosts: [\"test\"]\n",
            target.display()
        ),
    );

    virtbak()
        .args(["-c", config.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stderr(predicate::str::contains("deprecated"));
}

#[test]
fn test_backup_failure_exits_with_code_2() {
    // the test driver's disks do not exist on this machine, so the backup
    // fails and the group failure must surface as exit code 2
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("backups");
    let config = write_config(
        work.path(),
        &format!(
            "uri: \"test:///default\"\ngroups:\n  main:\n    target: {}\n    packager: directory\n    hosts: [\"test\"]\n",
            target.display()
        ),
    );

    virtbak()
        .args(["-c", config.to_str().unwrap(), "backup"])
        .assert()
        .code(2);
}

#[test]
fn test_restore_without_backups_fails() {
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("backups");
    std::fs::create_dir_all(&target).unwrap();
    let config = write_config(
        work.path(),
        &format!(
            "uri: \"test:///default\"\ngroups:\n  main:\n    target: {}\n    hosts: [\"test\"]\n",
            target.display()
        ),
    );

    virtbak()
        .args([
            "-c",
            config.to_str().unwrap(),
            "restore",
            "main",
            "test",
            work.path().join("out").to_str().unwrap(),
        ])
        .assert()
        .code(1);
}
