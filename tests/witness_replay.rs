//! Witness packaging and replay

mod common;

use capsulebox::CelError;
use common::{service, sh, workspace};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn witness_of(svc: &capsulebox::CapsuleService, ws: &std::path::Path, script: &str, compress: &str) -> serde_json::Value {
    let id = svc.call("capsule/create", json!({ "workspace": ws })).unwrap()["capsule_id"].clone();
    svc.call("capsule/exec", json!({ "capsule_id": id, "argv": sh(script) }))
        .unwrap();
    svc.call(
        "capsule/witness",
        json!({ "capsule_id": id, "compress": compress }),
    )
    .unwrap()
}

#[test]
fn test_replay_reproduces_root_digest() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("a.txt", "a"), ("old.txt", "old")]);
    let witness = witness_of(&svc, &ws, "echo b > b.txt; echo x >> a.txt; rm old.txt", "zstd");

    let replay = svc
        .call("capsule/replay", json!({ "witness_id": witness["witness_id"] }))
        .unwrap();
    assert_eq!(replay["replay_ok"], true);
    assert_eq!(replay["root_digest"], witness["root_digest"]);
    assert_eq!(replay["metrics"]["blobs_verified"], 2);
    assert!(replay["metrics"]["mismatches"].as_array().unwrap().is_empty());
}

#[test]
fn test_same_changes_same_root_regardless_of_packaging() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("a.txt", "a")]);

    let first = witness_of(&svc, &ws, "echo one > x; echo two > y", "zstd");
    let second = witness_of(&svc, &ws, "echo two > y; echo one > x", "none");
    assert_eq!(first["root_digest"], second["root_digest"]);

    let other = witness_of(&svc, &ws, "echo three > x; echo two > y", "zstd");
    assert_ne!(first["root_digest"], other["root_digest"]);
}

#[test]
fn test_tampered_blob_fails_replay() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let ws = workspace(&dir, &[("a.txt", "a")]);
    let witness = witness_of(&svc, &ws, "echo precious > data.bin", "none");
    let witness_id = witness["witness_id"].as_str().unwrap().to_string();

    let manifest = svc.witnesses().load_manifest(&witness_id).unwrap();
    let digest = manifest.records[0].digest.unwrap();
    let blob = svc.witnesses().store().locate(&digest).unwrap();
    fs::write(&blob, "tampered\n").unwrap();

    let report = svc.witnesses().replay(&witness_id).unwrap();
    assert!(!report.replay_ok);
    assert_eq!(report.metrics.mismatches, vec!["data.bin".to_string()]);
    assert!(matches!(
        svc.witnesses().verify(&witness_id),
        Err(CelError::WitnessIntegrity { .. })
    ));
}

#[test]
fn test_unknown_witness() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let missing = format!("blake3:{}", "0".repeat(64));
    assert!(matches!(
        svc.call("capsule/replay", json!({ "witness_id": missing })),
        Err(CelError::WitnessNotFound(_))
    ));
}
