//! Gated, all-or-nothing promotion of a change-set onto a real directory.
//!
//! Policies are evaluated first and a failing report stops everything before
//! the target is touched. Deletions are applied before writes, deepest path
//! first, so a path can switch between file and directory within one batch.
//! Each file or symlink is staged next to its final path and renamed into
//! place. The original of every path is backed up before its first write so
//! a failure partway through the batch can be undone.

use crate::config::types::{CelError, ChangeKind, ChangeRecord, ChangeSet, ResourceUsage, Result};
use crate::policy::{Evaluation, PolicyEngine, PolicyReport, TestRunner};
use crate::utils::hashing::{hash_file, hash_link};
use crate::utils::tree::{copy_entry, join_rel};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Inputs of one promotion attempt
pub struct PromoteRequest<'a> {
    pub mount: &'a Path,
    pub target: &'a Path,
    pub changes: &'a ChangeSet,
    pub policies: &'a [String],
    pub usage: &'a ResourceUsage,
    pub replay_ok: Option<bool>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteResult {
    /// For a dry run: whether a real promotion would go ahead
    pub promoted: bool,
    /// Paths written or removed (or that would be, for a dry run)
    pub applied: Vec<String>,
    pub dry_run: bool,
    pub policy_report: PolicyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Undo information for one applied step
#[derive(Debug)]
enum Step {
    Wrote { dst: PathBuf, backup: Option<PathBuf> },
    Removed { dst: PathBuf, backup: PathBuf },
    CreatedDir(PathBuf),
    /// A directory left empty by deletions
    RemovedDir(PathBuf),
}

struct Transaction {
    backup_dir: PathBuf,
    journal: Vec<Step>,
    applied: Vec<String>,
}

impl Transaction {
    fn backup(&self, rel: &str, original: &Path) -> io::Result<PathBuf> {
        let backup = join_rel(&self.backup_dir, rel)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, rel.to_string()))?;
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_entry(original, &backup)?;
        Ok(backup)
    }

    fn ensure_parents(&mut self, target_root: &Path, dst: &Path) -> io::Result<()> {
        let parent = match dst.parent() {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let mut missing = Vec::new();
        let mut cursor = parent;
        while cursor.starts_with(target_root) && fs::symlink_metadata(cursor).is_err() {
            missing.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            self.journal.push(Step::CreatedDir(dir));
        }
        Ok(())
    }

    fn write(&mut self, target_root: &Path, mount: &Path, record: &ChangeRecord) -> Result<()> {
        let src = resolve(mount, &record.path)?;
        let dst = resolve(target_root, &record.path)?;
        self.ensure_parents(target_root, &dst)?;

        let backup = match fs::symlink_metadata(&dst) {
            Ok(meta) if meta.is_dir() => {
                return Err(CelError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is a directory in the target", record.path),
                )))
            }
            Ok(_) => Some(self.backup(&record.path, &dst)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let staged = staging_path(&dst);
        if let Err(e) = stage(&src, &staged, record) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        if let Err(e) = fs::rename(&staged, &dst) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        self.journal.push(Step::Wrote { dst, backup });
        debug!("Promoted {}", record.path);
        Ok(())
    }

    fn remove(&mut self, target_root: &Path, mount: &Path, record: &ChangeRecord) -> Result<()> {
        let dst = resolve(target_root, &record.path)?;
        match fs::symlink_metadata(&dst) {
            Ok(meta) if meta.is_dir() => Err(CelError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory in the target", record.path),
            ))),
            Ok(_) => {
                let backup = self.backup(&record.path, &dst)?;
                fs::remove_file(&dst)?;
                self.journal.push(Step::Removed { dst: dst.clone(), backup });
                debug!("Removed {}", record.path);
                self.prune_parents(target_root, mount, &dst)?;
                Ok(())
            }
            // Already absent in the target
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the directories above `removed` that are now empty, stopping at
    /// the first one the mount still has as a directory
    fn prune_parents(&mut self, target_root: &Path, mount: &Path, removed: &Path) -> io::Result<()> {
        let mut cursor = removed.parent();
        while let Some(dir) = cursor {
            let rel = match dir.strip_prefix(target_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => break,
            };
            let kept = fs::symlink_metadata(mount.join(rel))
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if kept || fs::read_dir(dir)?.next().is_some() {
                break;
            }
            fs::remove_dir(dir)?;
            debug!("Removed emptied directory {}", dir.display());
            self.journal.push(Step::RemovedDir(dir.to_path_buf()));
            cursor = dir.parent();
        }
        Ok(())
    }

    /// Undo the journal newest first. Stops at the first step that cannot be
    /// undone.
    fn rollback(&mut self) -> std::result::Result<usize, (PathBuf, io::Error)> {
        let mut undone = 0;
        while let Some(step) = self.journal.pop() {
            let outcome = match &step {
                Step::Wrote { dst, backup: Some(backup) } | Step::Removed { dst, backup } => {
                    restore(backup, dst).map_err(|e| (dst.clone(), e))
                }
                Step::Wrote { dst, backup: None } => {
                    fs::remove_file(dst).map_err(|e| (dst.clone(), e))
                }
                Step::CreatedDir(dir) => fs::remove_dir(dir).map_err(|e| (dir.clone(), e)),
                Step::RemovedDir(dir) => fs::create_dir(dir).map_err(|e| (dir.clone(), e)),
            };
            outcome?;
            undone += 1;
        }
        Ok(undone)
    }
}

fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    join_rel(root, rel)
        .ok_or_else(|| CelError::InvalidRequest(format!("change path escapes its root: {}", rel)))
}

fn staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.promote-{}", name, Uuid::new_v4().simple()))
}

/// Copy `src` to `staged`, or recreate it there when the record is a
/// symlink, and check it still carries the recorded content
fn stage(src: &Path, staged: &Path, record: &ChangeRecord) -> Result<()> {
    if record.symlink {
        symlink(fs::read_link(src)?, staged)?;
    } else {
        fs::copy(src, staged)?;
    }
    if let Some(expected) = &record.digest {
        let actual = if record.symlink {
            hash_link(staged)?
        } else {
            hash_file(staged)?
        };
        if &actual != expected {
            return Err(CelError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} changed after the change-set was taken (expected {}, found {})",
                    record.path, expected, actual
                ),
            )));
        }
    }
    Ok(())
}

fn restore(backup: &Path, dst: &Path) -> io::Result<()> {
    let staged = staging_path(dst);
    copy_entry(backup, &staged)?;
    fs::rename(&staged, dst)
}

/// Deletions deepest first, then writes in path order
fn apply_order(changes: &ChangeSet) -> Vec<&ChangeRecord> {
    let (mut deletions, writes): (Vec<&ChangeRecord>, Vec<&ChangeRecord>) =
        changes.iter().partition(|r| r.kind == ChangeKind::Deleted);
    deletions.sort_by(|a, b| {
        depth(&b.path)
            .cmp(&depth(&a.path))
            .then_with(|| b.path.cmp(&a.path))
    });
    deletions.extend(writes);
    deletions
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|part| !part.is_empty()).count()
}

/// Paths whose record differs between two change-sets
fn drifted_paths(before: &ChangeSet, after: &ChangeSet) -> Vec<String> {
    let mut paths: Vec<String> = before
        .iter()
        .chain(after.iter())
        .filter(|r| before.get(&r.path) != after.get(&r.path))
        .map(|r| r.path.clone())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

pub struct PromoteEngine {
    policies: Arc<PolicyEngine>,
    backup_root: PathBuf,
}

impl PromoteEngine {
    pub fn new(policies: Arc<PolicyEngine>, backup_root: &Path) -> Self {
        PromoteEngine {
            policies,
            backup_root: backup_root.to_path_buf(),
        }
    }

    pub fn promote(
        &self,
        request: &PromoteRequest<'_>,
        tests: &mut dyn TestRunner,
    ) -> Result<PromoteResult> {
        let mut report = self.policies.evaluate(
            request.policies,
            &Evaluation {
                usage: request.usage,
                changes: request.changes,
                replay_ok: request.replay_ok,
                target_root: request.target,
            },
            tests,
        )?;

        if !report.passed {
            info!("Promotion to {} blocked by policy", request.target.display());
            return Ok(PromoteResult {
                promoted: false,
                applied: Vec::new(),
                dry_run: request.dry_run,
                error: Some(format!("Policy validation failed: {}", report.details.join("; "))),
                policy_report: report,
            });
        }

        // Required tests run in the capsule itself and may have rewritten it
        if let Some(after) = tests.changes_after()? {
            if after != *request.changes {
                let message = format!(
                    "require_tests commands {:?} changed the capsule after its change-set was taken: {}",
                    tests.commands_run(),
                    drifted_paths(request.changes, &after).join(", ")
                );
                warn!("Promotion to {} refused: {}", request.target.display(), message);
                report.details.push(message.clone());
                return Ok(PromoteResult {
                    promoted: false,
                    applied: Vec::new(),
                    dry_run: request.dry_run,
                    policy_report: report,
                    error: Some(message),
                });
            }
        }

        if request.dry_run {
            return Ok(PromoteResult {
                promoted: true,
                applied: request.changes.paths(),
                dry_run: true,
                policy_report: report,
                error: None,
            });
        }

        self.apply(request, report)
    }

    fn apply(&self, request: &PromoteRequest<'_>, mut report: PolicyReport) -> Result<PromoteResult> {
        let mut tx = Transaction {
            backup_dir: self.backup_root.join(Uuid::new_v4().simple().to_string()),
            journal: Vec::new(),
            applied: Vec::new(),
        };

        let mut failure = None;
        for record in apply_order(request.changes) {
            let outcome = match record.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    tx.write(request.target, request.mount, record)
                }
                ChangeKind::Deleted => tx.remove(request.target, request.mount, record),
            };
            match outcome {
                Ok(()) => tx.applied.push(record.path.clone()),
                Err(e) => {
                    failure = Some((record.path.clone(), e));
                    break;
                }
            }
        }

        let result = match failure {
            None => {
                tx.applied.sort();
                info!(
                    "Promoted {} paths into {}",
                    tx.applied.len(),
                    request.target.display()
                );
                Ok(PromoteResult {
                    promoted: true,
                    applied: std::mem::take(&mut tx.applied),
                    dry_run: false,
                    policy_report: report,
                    error: None,
                })
            }
            Some((path, cause)) => {
                error!("Promotion failed at {}: {}; rolling back", path, cause);
                match tx.rollback() {
                    Ok(undone) => {
                        let message = format!(
                            "apply failed at {}: {} (rolled back {} steps)",
                            path, cause, undone
                        );
                        report.details.push(message.clone());
                        Ok(PromoteResult {
                            promoted: false,
                            applied: Vec::new(),
                            dry_run: false,
                            policy_report: report,
                            error: Some(message),
                        })
                    }
                    Err((stuck, rollback_err)) => Err(CelError::PromotionPartialFailure {
                        path,
                        reason: format!(
                            "{}; rollback failed at {}: {}",
                            cause,
                            stuck.display(),
                            rollback_err
                        ),
                    }),
                }
            }
        };

        if tx.backup_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&tx.backup_dir) {
                warn!("Could not remove backup {}: {}", tx.backup_dir.display(), e);
            }
        }
        result
    }
}
