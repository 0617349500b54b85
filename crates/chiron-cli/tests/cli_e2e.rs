//! Exit-code and surface tests for the `chiron` binary.
//!
//! The contract under test: 0 success, 2 policy/verification failure,
//! 3 tool missing, 4 configuration/input invalid, 1 unexpected.

use std::path::Path;
use std::process::Command;

fn chiron() -> Command {
    Command::new(env!("CARGO_BIN_EXE_chiron"))
}

fn write(path: &Path, contents: &str) {
    std::fs::write(path, contents).expect("write fixture");
}

fn constraints_fixture(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("requirements.txt");
    write(
        &path,
        &format!(
            "demo-lib==1.2.3 --hash=sha256:{}\ndemo-util==0.4.7 --hash=sha256:{}\n",
            "a".repeat(64),
            "b".repeat(64)
        ),
    );
    path
}

#[test]
fn check_policy_allows_clean_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let policy = dir.path().join("policy.json");
    write(&policy, r#"{"default_allow": true}"#);

    let output = chiron()
        .current_dir(dir.path())
        .args(["check-policy", "--lock"])
        .arg(&lock)
        .arg("--policy")
        .arg(&policy)
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("allowed: true"));
}

#[test]
fn check_policy_blocks_denylisted_set_with_exit_2() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let policy = dir.path().join("policy.json");
    write(&policy, r#"{"denylist": ["demo-lib"]}"#);

    let output = chiron()
        .current_dir(dir.path())
        .args(["check-policy", "--lock"])
        .arg(&lock)
        .arg("--policy")
        .arg(&policy)
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(2), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("allowed: false"));
    assert!(stdout.contains("denylist"));
}

#[test]
fn check_policy_rejects_unknown_policy_fields_with_exit_4() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let policy = dir.path().join("policy.json");
    write(&policy, r#"{"default_allow": true, "surprise": 1}"#);

    let output = chiron()
        .current_dir(dir.path())
        .args(["check-policy", "--lock"])
        .arg(&lock)
        .arg("--policy")
        .arg(&policy)
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(4), "{output:?}");
}

#[test]
fn check_policy_json_emits_structured_verdict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let policy = dir.path().join("policy.json");
    write(&policy, r#"{"denylist": ["demo-lib"]}"#);

    let output = chiron()
        .current_dir(dir.path())
        .args(["--json", "check-policy", "--lock"])
        .arg(&lock)
        .arg("--policy")
        .arg(&policy)
        .output()
        .expect("run chiron");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let verdict: serde_json::Value = serde_json::from_str(&stdout).expect("stdout is JSON");
    assert_eq!(verdict["allowed"], serde_json::Value::Bool(false));
    assert_eq!(verdict["violations"][0]["rule"], "denylist");
}

#[test]
fn verify_bundle_on_missing_directory_exits_2() {
    let dir = tempfile::tempdir().expect("tempdir");

    let output = chiron()
        .current_dir(dir.path())
        .args(["verify-bundle", "--bundle", "does-not-exist"])
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(2), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bundle_integrity"), "{stderr}");
    assert!(stderr.contains("run id:"), "failures carry a run id");
}

#[test]
fn plan_upgrade_previews_drift() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let snapshot = dir.path().join("snapshot.json");
    write(
        &snapshot,
        r#"{
  "fetched_at": "2025-06-01T00:00:00Z",
  "packages": {
    "demo-lib": [{"version": "1.2.4", "released_at": "2025-01-01T00:00:00Z"}]
  }
}"#,
    );

    let output = chiron()
        .current_dir(dir.path())
        .args(["plan-upgrade", "--lock"])
        .arg(&lock)
        .arg("--snapshot")
        .arg(&snapshot)
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("demo-lib: 1.2.3 -> 1.2.4"), "{stdout}");
    assert!(stdout.contains("[safe]"), "{stdout}");
}

#[test]
fn plan_upgrade_with_malformed_snapshot_exits_4() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock = constraints_fixture(dir.path());
    let snapshot = dir.path().join("snapshot.json");
    write(&snapshot, "not json");

    let output = chiron()
        .current_dir(dir.path())
        .args(["plan-upgrade", "--lock"])
        .arg(&lock)
        .arg("--snapshot")
        .arg(&snapshot)
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(4), "{output:?}");
}

#[test]
fn doctor_reports_and_exits_0() {
    let dir = tempfile::tempdir().expect("tempdir");

    let output = chiron()
        .current_dir(dir.path())
        .arg("doctor")
        .output()
        .expect("run chiron");

    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("external tools:"));
    assert!(stdout.contains("resolve"));
    assert!(stdout.contains("key backend"));
}
