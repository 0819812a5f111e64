//! End-to-end capsule workflow through the named operations

mod common;

use common::{service, sh, workspace};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_modify_diff_witness_promote() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("test.txt", "Original content")]);

    let created = svc.call("capsule/create", json!({ "workspace": ws })).unwrap();
    let id = created["capsule_id"].as_str().unwrap().to_string();
    let mount = created["mount"].as_str().unwrap().to_string();
    assert_ne!(mount, ws.to_string_lossy());

    let exec = svc
        .call(
            "capsule/exec",
            json!({
                "capsule_id": id,
                "argv": sh("printf 'Modified content' > test.txt"),
                "timeout_ms": 20000,
            }),
        )
        .unwrap();
    assert_eq!(exec["exit_code"], 0);
    assert_eq!(exec["timed_out"], false);

    let diff = svc.call("capsule/diff", json!({ "capsule_id": id })).unwrap();
    assert_eq!(diff["summary"]["modified"], 1);
    assert_eq!(diff["summary"]["added"], 0);
    assert_eq!(diff["summary"]["deleted"], 0);
    let text = diff["diff"].as_str().unwrap();
    assert!(text.contains("-Original content"));
    assert!(text.contains("+Modified content"));

    let witness = svc.call("capsule/witness", json!({ "capsule_id": id })).unwrap();
    let root = witness["root_digest"].as_str().unwrap();
    assert!(root.starts_with("blake3:"));
    assert!(witness["witness_id"].as_str().unwrap().starts_with("blake3:"));

    // Still untouched before promotion
    assert_eq!(fs::read_to_string(ws.join("test.txt")).unwrap(), "Original content");

    let promoted = svc
        .call(
            "capsule/promote",
            json!({ "capsule_id": id, "policies": ["baseline"] }),
        )
        .unwrap();
    assert_eq!(promoted["promoted"], true);
    assert_eq!(promoted["applied"], json!(["test.txt"]));
    assert_eq!(fs::read_to_string(ws.join("test.txt")).unwrap(), "Modified content");
}

#[test]
fn test_changes_accumulate_across_executions() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("keep.txt", "k"), ("gone.txt", "g")]);
    let id = svc.call("capsule/create", json!({ "workspace": ws })).unwrap()["capsule_id"].clone();

    for script in ["echo a > new.txt", "rm gone.txt", "echo b >> keep.txt"] {
        let exec = svc
            .call("capsule/exec", json!({ "capsule_id": id, "argv": sh(script) }))
            .unwrap();
        assert_eq!(exec["exit_code"], 0);
    }

    let diff = svc.call("capsule/diff", json!({ "capsule_id": id })).unwrap();
    assert_eq!(diff["summary"]["added"], 1);
    assert_eq!(diff["summary"]["deleted"], 1);
    assert_eq!(diff["summary"]["modified"], 1);
    assert!(ws.join("gone.txt").exists());
}

#[test]
fn test_nonzero_exit_and_timeout_are_results() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("a", "a")]);
    let id = svc.call("capsule/create", json!({ "workspace": ws })).unwrap()["capsule_id"].clone();

    let failed = svc
        .call(
            "capsule/exec",
            json!({ "capsule_id": id, "argv": sh("echo oops >&2; exit 3") }),
        )
        .unwrap();
    assert_eq!(failed["exit_code"], 3);
    assert_eq!(failed["stderr"], "oops\n");

    let slow = svc
        .call(
            "capsule/exec",
            json!({
                "capsule_id": id,
                "argv": sh("echo partial; sleep 30"),
                "timeout_ms": 500,
            }),
        )
        .unwrap();
    assert_eq!(slow["timed_out"], true);
    assert_eq!(slow["exit_code"], -1);
    assert_eq!(slow["stdout"], "partial\n");
}

#[test]
fn test_env_whitelist_and_clock_offset() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("a", "a")]);
    std::env::set_var("CAPSULE_TEST_VISIBLE", "yes");
    std::env::set_var("CAPSULE_TEST_HIDDEN", "secret");

    let created = svc
        .call(
            "capsule/create",
            json!({
                "workspace": ws,
                "clock_offset_sec": 3600,
                "env_whitelist": ["CAPSULE_TEST_VISIBLE"],
            }),
        )
        .unwrap();
    let exec = svc
        .call(
            "capsule/exec",
            json!({
                "capsule_id": created["capsule_id"],
                "argv": sh("echo \"$CAPSULE_TEST_VISIBLE:$CAPSULE_TEST_HIDDEN:$CAPSULE_CLOCK_OFFSET\""),
            }),
        )
        .unwrap();
    assert_eq!(exec["stdout"], "yes::3600\n");
}

#[test]
fn test_unknown_capsule() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let err = svc
        .call("capsule/exec", json!({ "capsule_id": "cap_missing", "argv": ["true"] }))
        .unwrap_err();
    assert!(matches!(err, capsulebox::CelError::CapsuleNotFound(_)));
}
