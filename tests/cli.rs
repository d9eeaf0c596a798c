//! Command line surface tests.

use std::path::Path;
use std::process::Output;

use assert_cmd::Command;

fn reversion() -> Command {
    Command::cargo_bin("reversion").unwrap()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn create_workdir(root: &Path) {
    reversion()
        .args(["repo", "create"])
        .arg(root)
        .assert()
        .success();
}

#[test]
fn version_flag_prints_the_format_sentinel() {
    let output = reversion().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert_eq!(
        stdout_of(&output).trim(),
        "c0747b1e-4bd2-11e9-a623-bff5824aa175"
    );
}

#[test]
fn create_commit_status_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("w");
    create_workdir(&root);

    std::fs::write(root.join("a.txt"), b"hello").unwrap();

    let output = reversion()
        .current_dir(&root)
        .args(["commit"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("created revision 1"));

    // clean tree: status prints nothing
    let output = reversion()
        .current_dir(&root)
        .arg("status")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).trim().is_empty());

    // a second commit without changes does nothing
    let output = reversion()
        .current_dir(&root)
        .arg("commit")
        .output()
        .unwrap();
    assert!(stdout_of(&output).contains("nothing to commit"));

    std::fs::write(root.join("a.txt"), b"changed").unwrap();
    let output = reversion()
        .current_dir(&root)
        .arg("status")
        .output()
        .unwrap();
    assert!(stdout_of(&output).contains("modified: a.txt"));
}

#[test]
fn restore_rewinds_to_an_earlier_revision() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("w");
    create_workdir(&root);

    std::fs::write(root.join("a.txt"), b"one").unwrap();
    reversion().current_dir(&root).arg("commit").assert().success();
    std::fs::write(root.join("a.txt"), b"two").unwrap();
    reversion().current_dir(&root).arg("commit").assert().success();

    reversion()
        .current_dir(&root)
        .args(["restore", "--revision", "1"])
        .assert()
        .success();

    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"one");

    // the pre-restore state was preserved as revision 3
    let output = reversion()
        .current_dir(&root)
        .args(["tag", "list"])
        .output()
        .unwrap();
    assert!(stdout_of(&output).contains("3"));
}

#[test]
fn tag_commands_edit_snapshot_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("w");
    create_workdir(&root);

    std::fs::write(root.join("a.txt"), b"x").unwrap();
    reversion().current_dir(&root).arg("commit").assert().success();

    reversion()
        .current_dir(&root)
        .args(["tag", "create", "1", "release"])
        .assert()
        .success();
    reversion()
        .current_dir(&root)
        .args(["tag", "modify", "1", "--pin", "--description", "first cut"])
        .assert()
        .success();

    let output = reversion()
        .current_dir(&root)
        .args(["tag", "info", "1"])
        .output()
        .unwrap();
    let info = stdout_of(&output);
    assert!(info.contains("release"));
    assert!(info.contains("first cut"));
    assert!(info.contains("pinned:      true"));

    let output = reversion()
        .current_dir(&root)
        .args(["tag", "list"])
        .output()
        .unwrap();
    assert!(stdout_of(&output).contains("[pinned]"));
}

#[test]
fn policy_commands_manage_the_set() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("w");
    create_workdir(&root);

    reversion()
        .current_dir(&root)
        .args(["policy", "create", "versions", "5"])
        .assert()
        .success();
    reversion()
        .current_dir(&root)
        .args(["policy", "create", "staggered", "1", "day"])
        .assert()
        .success();

    let output = reversion()
        .current_dir(&root)
        .args(["policy", "list"])
        .output()
        .unwrap();
    let listing = stdout_of(&output);
    assert!(listing.contains("Keep the newest 5 versions of each file"));
    assert!(listing.contains("Keep 1 version per day forever"));

    reversion()
        .current_dir(&root)
        .args(["policy", "clear"])
        .assert()
        .success();
    let output = reversion()
        .current_dir(&root)
        .args(["policy", "list"])
        .output()
        .unwrap();
    assert!(stdout_of(&output).trim().is_empty());
}

#[test]
fn verify_reports_a_healthy_repository() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("w");
    create_workdir(&root);

    std::fs::write(root.join("a.txt"), b"fine").unwrap();
    reversion().current_dir(&root).arg("commit").assert().success();

    let output = reversion()
        .current_dir(&root)
        .arg("verify")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("no problems found"));
}

#[test]
fn user_errors_exit_with_code_one() {
    let dir = tempfile::tempdir().unwrap();

    // not a work directory
    reversion()
        .current_dir(dir.path())
        .arg("status")
        .assert()
        .code(1);

    // creating over an existing work directory
    let root = dir.path().join("w");
    create_workdir(&root);
    reversion()
        .args(["repo", "create"])
        .arg(&root)
        .assert()
        .code(1);
}
