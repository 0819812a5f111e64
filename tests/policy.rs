//! Policy table and evaluation through the public API

mod common;

use capsulebox::policy::{Evaluation, NoTests, PolicyEngine, PolicyRule};
use capsulebox::{ChangeKind, ChangeRecord, ChangeSet, ResourceUsage};
use common::service;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

fn change_set(paths: &[&str]) -> ChangeSet {
    ChangeSet::from_records(paths.iter().map(|p| ChangeRecord {
        kind: ChangeKind::Modified,
        path: p.to_string(),
        digest: None,
        size: 0,
        symlink: false,
    }))
}

#[test]
fn test_rss_ceiling_violation() {
    let engine = PolicyEngine::new();
    let mut rule = PolicyRule::named("small");
    rule.max_rss_mb = Some(1);
    engine.add_policy(rule).unwrap();

    let usage = ResourceUsage {
        rss_max_kb: 2048,
        ..Default::default()
    };
    let changes = change_set(&["a"]);
    let report = engine
        .evaluate(
            &["small".to_string()],
            &Evaluation {
                usage: &usage,
                changes: &changes,
                replay_ok: None,
                target_root: Path::new("/tmp/target"),
            },
            &mut NoTests,
        )
        .unwrap();
    assert!(!report.passed);
    assert!(!report.resource_ok);
    assert!(!report.resource_violations.is_empty());
}

#[test]
fn test_strict_policy_denies_git_and_env() {
    let engine = PolicyEngine::new();
    let usage = ResourceUsage::default();
    let changes = change_set(&[".git/config", "app/.env", "src/main.rs"]);
    let report = engine
        .evaluate(
            &["strict".to_string()],
            &Evaluation {
                usage: &usage,
                changes: &changes,
                replay_ok: None,
                target_root: Path::new("/tmp/target"),
            },
            &mut NoTests,
        )
        .unwrap();
    assert!(!report.passed);
    assert_eq!(
        report.deny_paths,
        vec![".git/config".to_string(), "app/.env".to_string()]
    );
}

#[test]
fn test_policy_set_overwrites() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    svc.call("policy/set", json!({ "name": "p", "rules": { "max_cpu_ms": 5 } }))
        .unwrap();
    svc.call("policy/set", json!({ "name": "p", "rules": { "max_cpu_ms": 50 } }))
        .unwrap();
    let rule = svc.policies().get_policy("p").unwrap().unwrap();
    assert_eq!(rule.max_cpu_ms, Some(50));
    assert_eq!(rule.name, "p");
}

#[test]
fn test_policy_set_rejects_bad_rules() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir);
    let err = svc
        .call("policy/set", json!({ "name": "p", "rules": { "max_cpu_ms": "lots" } }))
        .unwrap_err();
    assert!(matches!(err, capsulebox::CelError::InvalidRequest(_)));
}

#[test]
fn test_configured_policies_are_seeded() {
    let dir = TempDir::new().unwrap();
    let mut config = capsulebox::CelConfig::with_storage_root(dir.path().join("store"));
    config.sandbox_kind = capsulebox::SandboxPreference::Portable;
    let mut rule = PolicyRule::named("from-config");
    rule.deny_paths = vec!["secrets/*".to_string()];
    config.policies.push(rule);

    let svc = capsulebox::CapsuleService::new(config).unwrap();
    let names = svc.policies().policy_names().unwrap();
    assert!(names.contains(&"from-config".to_string()));
    assert!(names.contains(&"baseline".to_string()));
    assert!(names.contains(&"strict".to_string()));
}
