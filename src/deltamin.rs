//! Delta minimization.
//!
//! Shrinks a failing change-set to a smaller subset that still reproduces
//! the failure. Each round builds a work-list (the two halves first, then
//! every single-removal complement) and restarts from the first candidate
//! that still fails. The budget is checked before every evaluation, and a
//! truncated search is reported as such.

use crate::cel::{create_sandbox, ExecSpec, SandboxSettings};
use crate::config::settings::SandboxPreference;
use crate::config::types::{CelError, ChangeKind, ChangeRecord, ExecutionResult, Result};
use crate::utils::tree::{copy_entry, join_rel};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What counts as "still failing"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePredicate {
    #[default]
    ExitNonzero,
    StdoutContains {
        pattern: String,
    },
    StderrContains {
        pattern: String,
    },
}

impl FailurePredicate {
    pub fn holds(&self, result: &ExecutionResult) -> bool {
        match self {
            FailurePredicate::ExitNonzero => result.exit_code != 0,
            FailurePredicate::StdoutContains { pattern } => {
                result.stdout_lossy().contains(pattern.as_str())
            }
            FailurePredicate::StderrContains { pattern } => {
                result.stderr_lossy().contains(pattern.as_str())
            }
        }
    }
}

/// Materializes a subset of changes and reports whether the failure shows
pub trait CandidateRunner {
    fn reproduces(&mut self, subset: &[ChangeRecord]) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub minimal: Vec<ChangeRecord>,
    /// False when the budget ran out before the search did
    pub completed: bool,
    pub iterations: usize,
    /// Distinct subsets actually executed
    pub evaluations: usize,
}

#[derive(Debug, Clone)]
pub struct DeltaMinimizer {
    budget: Duration,
}

impl DeltaMinimizer {
    pub fn new(budget: Duration) -> Self {
        DeltaMinimizer { budget }
    }

    pub fn minimize(
        &self,
        changes: &[ChangeRecord],
        runner: &mut dyn CandidateRunner,
    ) -> Result<DeltaOutcome> {
        let started = Instant::now();
        let mut cache: HashMap<Vec<String>, bool> = HashMap::new();
        let mut evaluations = 0;

        // The full set is always evaluated, budget or not
        evaluations += 1;
        if !runner.reproduces(changes)? {
            return Err(CelError::NotReproducible(format!(
                "the failure does not occur with all {} changes applied",
                changes.len()
            )));
        }
        cache.insert(key(changes), true);

        let mut current = changes.to_vec();
        let mut iterations = 0;
        let completed = 'search: loop {
            iterations += 1;
            let mut work = candidates(&current);
            debug!(
                "Round {}: {} changes, {} candidates",
                iterations,
                current.len(),
                work.len()
            );

            while let Some(candidate) = work.pop_front() {
                let candidate_key = key(&candidate);
                let fails = match cache.get(&candidate_key) {
                    Some(&cached) => cached,
                    None => {
                        if started.elapsed() >= self.budget {
                            info!(
                                "Delta minimization budget spent after {} evaluations",
                                evaluations
                            );
                            break 'search false;
                        }
                        evaluations += 1;
                        let fails = runner.reproduces(&candidate)?;
                        cache.insert(candidate_key, fails);
                        fails
                    }
                };
                if fails {
                    current = candidate;
                    continue 'search;
                }
            }
            break true;
        };

        info!(
            "Minimized {} changes to {} ({} evaluations, completed={})",
            changes.len(),
            current.len(),
            evaluations,
            completed
        );
        Ok(DeltaOutcome {
            minimal: current,
            completed,
            iterations,
            evaluations,
        })
    }
}

fn key(records: &[ChangeRecord]) -> Vec<String> {
    records.iter().map(|r| r.path.clone()).collect()
}

/// Halves first, then single-removal complements. Empty subsets are never
/// proposed.
fn candidates(current: &[ChangeRecord]) -> VecDeque<Vec<ChangeRecord>> {
    let mut work = VecDeque::new();
    if current.len() < 2 {
        return work;
    }
    let mid = current.len() / 2;
    work.push_back(current[..mid].to_vec());
    work.push_back(current[mid..].to_vec());
    if current.len() > 2 {
        for skip in 0..current.len() {
            let complement: Vec<ChangeRecord> = current
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, r)| r.clone())
                .collect();
            work.push_back(complement);
        }
    }
    work
}

fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    join_rel(root, rel)
        .ok_or_else(|| CelError::InvalidRequest(format!("change path escapes the capsule: {}", rel)))
}

/// Apply the deletions of `subset` to `mount`, deepest first, then copy the
/// rest of its content over from `source`. Symlinks are recreated as links.
pub fn apply_subset(mount: &Path, source: &Path, subset: &[ChangeRecord]) -> Result<()> {
    let (mut deletions, writes): (Vec<&ChangeRecord>, Vec<&ChangeRecord>) =
        subset.iter().partition(|r| r.kind == ChangeKind::Deleted);
    // Descendants sort after their ancestors
    deletions.sort_by(|a, b| b.path.cmp(&a.path));

    for record in deletions {
        let dst = resolve(mount, &record.path)?;
        match fs::remove_file(&dst) {
            Ok(()) => prune_emptied(mount, source, &dst)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    for record in writes {
        let src = resolve(source, &record.path)?;
        let dst = resolve(mount, &record.path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::symlink_metadata(&dst) {
            Ok(meta) if !meta.is_dir() => fs::remove_file(&dst)?,
            _ => {}
        }
        copy_entry(&src, &dst)?;
    }
    Ok(())
}

/// Drop directories above `removed` left empty, unless `source` still has
/// them as directories
fn prune_emptied(mount: &Path, source: &Path, removed: &Path) -> io::Result<()> {
    let mut cursor = removed.parent();
    while let Some(dir) = cursor {
        let rel = match dir.strip_prefix(mount) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => break,
        };
        let kept = fs::symlink_metadata(source.join(rel))
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if kept || fs::read_dir(dir)?.next().is_some() {
            break;
        }
        fs::remove_dir(dir)?;
        cursor = dir.parent();
    }
    Ok(())
}

/// Evaluates candidates in fresh throwaway sandboxes over the base
pub struct ScratchRunner<'a> {
    pub preference: SandboxPreference,
    pub base: &'a Path,
    /// Sandbox root holding the full change-set's content
    pub source: &'a Path,
    pub scratch_root: PathBuf,
    pub settings: SandboxSettings,
    pub command: ExecSpec,
    pub predicate: FailurePredicate,
}

impl CandidateRunner for ScratchRunner<'_> {
    fn reproduces(&mut self, subset: &[ChangeRecord]) -> Result<bool> {
        let dir = self.scratch_root.join(Uuid::new_v4().simple().to_string());
        let mut sandbox = create_sandbox(self.preference, self.base, &dir, self.settings.clone())?;

        let outcome = match apply_subset(sandbox.mount(), self.source, subset) {
            Ok(()) => sandbox.execute(&self.command).map(Some),
            Err(e) => {
                // A subset that cannot exist on disk on its own
                debug!("Candidate of {} changes cannot be materialized: {}", subset.len(), e);
                Ok(None)
            }
        };
        let cleaned = sandbox.cleanup();

        let result = match outcome? {
            Some(result) => result,
            None => {
                cleaned?;
                return Ok(false);
            }
        };
        cleaned?;
        let holds = self.predicate.holds(&result);
        debug!(
            "Candidate of {} changes: exit {}, reproduces={}",
            subset.len(),
            result.exit_code,
            holds
        );
        Ok(holds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cel::test_support::settings;
    use crate::config::types::{ResourceUsage, TouchedPaths};
    use crate::utils::hashing::hash_bytes;
    use tempfile::TempDir;

    fn records(paths: &[&str]) -> Vec<ChangeRecord> {
        paths
            .iter()
            .map(|p| ChangeRecord {
                kind: ChangeKind::Added,
                path: p.to_string(),
                digest: Some(hash_bytes(p.as_bytes())),
                size: 1,
                symlink: false,
            })
            .collect()
    }

    /// Fails whenever every culprit is present
    struct Culprits {
        needed: Vec<&'static str>,
        calls: usize,
        delay: Duration,
    }

    impl CandidateRunner for Culprits {
        fn reproduces(&mut self, subset: &[ChangeRecord]) -> Result<bool> {
            self.calls += 1;
            std::thread::sleep(self.delay);
            Ok(self
                .needed
                .iter()
                .all(|n| subset.iter().any(|r| r.path == *n)))
        }
    }

    fn culprits(needed: Vec<&'static str>) -> Culprits {
        Culprits {
            needed,
            calls: 0,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_finds_single_culprit() {
        let all = records(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let mut runner = culprits(vec!["f"]);
        let outcome = DeltaMinimizer::new(Duration::from_secs(60))
            .minimize(&all, &mut runner)
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(key(&outcome.minimal), vec!["f"]);
        assert_eq!(outcome.evaluations, runner.calls);
    }

    #[test]
    fn test_finds_interacting_pair() {
        let all = records(&["a", "b", "c", "d", "e"]);
        let mut runner = culprits(vec!["a", "e"]);
        let outcome = DeltaMinimizer::new(Duration::from_secs(60))
            .minimize(&all, &mut runner)
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(key(&outcome.minimal), vec!["a", "e"]);
    }

    #[test]
    fn test_result_always_reproduces() {
        let all = records(&["p1", "p2", "p3", "p4", "p5", "p6", "p7"]);
        for needed in [vec!["p2"], vec!["p3", "p6"], vec!["p1", "p4", "p7"]] {
            let mut runner = culprits(needed.clone());
            let outcome = DeltaMinimizer::new(Duration::from_secs(60))
                .minimize(&all, &mut runner)
                .unwrap();
            assert!(runner.reproduces(&outcome.minimal).unwrap());
            assert_eq!(key(&outcome.minimal), needed);
        }
    }

    #[test]
    fn test_not_reproducible() {
        let all = records(&["a", "b"]);
        let mut runner = culprits(vec!["zzz"]);
        let result = DeltaMinimizer::new(Duration::from_secs(60)).minimize(&all, &mut runner);
        assert!(matches!(result, Err(CelError::NotReproducible(_))));
    }

    #[test]
    fn test_budget_truncation_is_reported() {
        let all = records(&["a", "b", "c", "d"]);
        let mut runner = Culprits {
            needed: vec!["d"],
            calls: 0,
            delay: Duration::from_millis(30),
        };
        let outcome = DeltaMinimizer::new(Duration::from_millis(10))
            .minimize(&all, &mut runner)
            .unwrap();
        assert!(!outcome.completed);
        assert_eq!(runner.calls, 1);
        assert_eq!(outcome.minimal.len(), 4);
    }

    #[test]
    fn test_predicates() {
        let result = ExecutionResult {
            exit_code: 0,
            stdout: b"all good".to_vec(),
            stderr: b"warning: flaky".to_vec(),
            stdout_truncated: false,
            stderr_truncated: false,
            timed_out: false,
            duration_ms: 1,
            usage: ResourceUsage::default(),
            touched: TouchedPaths::default(),
        };
        assert!(!FailurePredicate::ExitNonzero.holds(&result));
        assert!(FailurePredicate::StderrContains {
            pattern: "flaky".into()
        }
        .holds(&result));
        assert!(!FailurePredicate::StdoutContains {
            pattern: "flaky".into()
        }
        .holds(&result));

        let parsed: FailurePredicate =
            serde_json::from_str(r#"{"kind":"stdout_contains","pattern":"boom"}"#).unwrap();
        assert_eq!(
            parsed,
            FailurePredicate::StdoutContains {
                pattern: "boom".into()
            }
        );
    }

    #[test]
    fn test_scratch_runner_uses_fresh_sandboxes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        let source = dir.path().join("source");
        for root in [&base, &source] {
            fs::create_dir_all(root).unwrap();
            fs::write(root.join("keep"), "k").unwrap();
        }
        fs::write(source.join("bad"), "x").unwrap();
        fs::write(source.join("fine"), "y").unwrap();
        let all = records(&["bad", "fine"]);

        let mut runner = ScratchRunner {
            preference: SandboxPreference::Portable,
            base: &base,
            source: &source,
            scratch_root: dir.path().join("scratch"),
            settings: settings(),
            command: ExecSpec::new(
                vec!["sh".into(), "-c".into(), "test ! -e bad".into()],
                Duration::from_secs(20),
            ),
            predicate: FailurePredicate::ExitNonzero,
        };
        let outcome = DeltaMinimizer::new(Duration::from_secs(60))
            .minimize(&all, &mut runner)
            .unwrap();
        assert_eq!(key(&outcome.minimal), vec!["bad"]);
        // Every scratch sandbox was cleaned up
        assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
        assert!(!base.join("bad").exists());
    }

    #[test]
    fn test_file_replaced_by_directory_is_minimized() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        let source = dir.path().join("source");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("x"), "file").unwrap();
        fs::create_dir_all(source.join("x")).unwrap();
        fs::write(source.join("x/y"), "y").unwrap();
        let all = vec![
            ChangeRecord {
                kind: ChangeKind::Deleted,
                path: "x".into(),
                digest: None,
                size: 0,
                symlink: false,
            },
            ChangeRecord {
                kind: ChangeKind::Added,
                path: "x/y".into(),
                digest: Some(hash_bytes(b"y")),
                size: 1,
                symlink: false,
            },
        ];

        let mut runner = ScratchRunner {
            preference: SandboxPreference::Portable,
            base: &base,
            source: &source,
            scratch_root: dir.path().join("scratch"),
            settings: settings(),
            command: ExecSpec::new(
                vec!["sh".into(), "-c".into(), "test ! -d x".into()],
                Duration::from_secs(20),
            ),
            predicate: FailurePredicate::ExitNonzero,
        };
        // `x/y` alone cannot be laid down over the file `x`
        assert!(!runner.reproduces(&all[1..]).unwrap());

        let outcome = DeltaMinimizer::new(Duration::from_secs(60))
            .minimize(&all, &mut runner)
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(key(&outcome.minimal), vec!["x", "x/y"]);
        assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn test_apply_subset_replaces_directory_with_file_and_link() {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("mount");
        let source = dir.path().join("source");
        fs::create_dir_all(mount.join("d")).unwrap();
        fs::write(mount.join("d/f"), "inner").unwrap();
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("d"), "now a file").unwrap();
        std::os::unix::fs::symlink("d", source.join("link")).unwrap();

        let subset = vec![
            ChangeRecord {
                kind: ChangeKind::Added,
                path: "d".into(),
                digest: Some(hash_bytes(b"now a file")),
                size: 10,
                symlink: false,
            },
            ChangeRecord {
                kind: ChangeKind::Deleted,
                path: "d/f".into(),
                digest: None,
                size: 0,
                symlink: false,
            },
            ChangeRecord {
                kind: ChangeKind::Added,
                path: "link".into(),
                digest: Some(hash_bytes(b"d")),
                size: 1,
                symlink: true,
            },
        ];
        apply_subset(&mount, &source, &subset).unwrap();
        assert_eq!(fs::read_to_string(mount.join("d")).unwrap(), "now a file");
        assert_eq!(fs::read_link(mount.join("link")).unwrap(), PathBuf::from("d"));
    }
}
