//! Shared fixtures for integration tests

#![allow(dead_code)]

use capsulebox::{CapsuleService, CelConfig, SandboxPreference};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Service over a private storage root using directory-copy capsules
pub fn service(dir: &TempDir) -> CapsuleService {
    init_logging();
    let mut config = CelConfig::with_storage_root(dir.path().join("store"));
    config.sandbox_kind = SandboxPreference::Portable;
    config.cleanup_retry.initial_backoff_ms = 1;
    CapsuleService::new(config).expect("service starts")
}

/// Workspace holding `files` as (relative path, content)
pub fn workspace(dir: &TempDir, files: &[(&str, &str)]) -> PathBuf {
    let ws = dir.path().join("workspace");
    for (rel, content) in files {
        let path = ws.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    fs::create_dir_all(&ws).unwrap();
    ws
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Sorted (path, content) listing of every file under `root`
pub fn tree_listing(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    out.sort();
    out
}
