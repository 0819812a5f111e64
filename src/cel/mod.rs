//! Counterfactual Execution Layer.
//!
//! One capability interface, [`Sandbox`], with three self-contained
//! strategies chosen at construction time:
//!
//! - [`overlay::OverlaySandbox`]: overlayfs above the read-only base; the
//!   upper layer is the record of what was touched.
//! - [`snapshot::SnapshotSandbox`]: directory copy, full snapshots around each
//!   execution plus an mtime monitor that catches transient files.
//! - [`portable::PortableSandbox`]: directory copy with snapshots only.
//!
//! Every strategy reports changes against the pristine snapshot taken at
//! creation, and a command exiting nonzero is a result, never an error.

pub mod overlay;
pub mod portable;
pub mod snapshot;
pub mod tracker;

use crate::config::settings::SandboxPreference;
use crate::config::types::{
    CelError, ChangeSet, ExecutionResult, Result, SandboxKind, TouchedPaths,
};
use crate::exec::executor::{ExecRequest, Executor, RawExecution};
use crate::kernel::mount::overlay_supported;
use crate::utils::retry::RetryPolicy;
use crate::utils::tree::join_rel;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracker::TreeSnapshot;

pub use overlay::OverlaySandbox;
pub use portable::PortableSandbox;
pub use snapshot::SnapshotSandbox;

/// File name of the persisted pristine snapshot inside a capsule directory
pub const PRISTINE_FILE: &str = "pristine.json";

/// A command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    /// Working directory relative to the sandbox root
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub stdin: Option<Vec<u8>>,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        ExecSpec {
            argv,
            cwd: None,
            timeout,
            stdin: None,
        }
    }
}

/// Per-capsule execution settings shared by every strategy
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub executor: Executor,
    pub env: BTreeMap<String, String>,
    pub monitor_interval: Duration,
    pub cleanup_retry: RetryPolicy,
}

/// Capability set every sandbox strategy provides
pub trait Sandbox: Send {
    fn kind(&self) -> SandboxKind;

    /// Root path commands see as their workspace
    fn mount(&self) -> &Path;

    /// Pre-state the change-set is measured against
    fn base(&self) -> &Path;

    fn execute(&mut self, spec: &ExecSpec) -> Result<ExecutionResult>;

    /// Changes accumulated since creation. Side-effect free.
    fn get_changes(&self) -> Result<ChangeSet>;

    fn pristine(&self) -> &TreeSnapshot;

    /// Release the sandbox root. Safe to call repeatedly.
    fn cleanup(&mut self) -> Result<()>;
}

/// Pick a strategy for this host
pub fn detect(preference: SandboxPreference) -> SandboxKind {
    match preference {
        SandboxPreference::Overlay => SandboxKind::Overlay,
        SandboxPreference::Snapshot => SandboxKind::Snapshot,
        SandboxPreference::Portable => SandboxKind::Portable,
        SandboxPreference::Auto => {
            if cfg!(target_os = "linux") {
                if overlay_supported() {
                    SandboxKind::Overlay
                } else {
                    SandboxKind::Portable
                }
            } else {
                SandboxKind::Snapshot
            }
        }
    }
}

/// Create a sandbox over `base` with its artifacts under `capsule_dir`.
/// Under [`SandboxPreference::Auto`] a failed overlay mount falls back to the
/// portable strategy.
pub fn create_sandbox(
    preference: SandboxPreference,
    base: &Path,
    capsule_dir: &Path,
    settings: SandboxSettings,
) -> Result<Box<dyn Sandbox>> {
    let kind = detect(preference);
    match kind {
        SandboxKind::Overlay => match OverlaySandbox::create(base, capsule_dir, settings.clone()) {
            Ok(sandbox) => Ok(Box::new(sandbox)),
            Err(e) if preference == SandboxPreference::Auto => {
                warn!("Overlay unavailable ({}), falling back to directory copy", e);
                let _ = fs::remove_dir_all(capsule_dir);
                Ok(Box::new(PortableSandbox::create(base, capsule_dir, settings)?))
            }
            Err(e) => Err(e),
        },
        SandboxKind::Snapshot => Ok(Box::new(SnapshotSandbox::create(base, capsule_dir, settings)?)),
        SandboxKind::Portable => Ok(Box::new(PortableSandbox::create(base, capsule_dir, settings)?)),
    }
}

/// Re-open a sandbox left on disk by an earlier registry instance
pub fn reattach_sandbox(
    kind: SandboxKind,
    base: &Path,
    capsule_dir: &Path,
    settings: SandboxSettings,
) -> Result<Box<dyn Sandbox>> {
    Ok(match kind {
        SandboxKind::Overlay => Box::new(OverlaySandbox::reattach(base, capsule_dir, settings)?),
        SandboxKind::Snapshot => Box::new(SnapshotSandbox::reattach(base, capsule_dir, settings)?),
        SandboxKind::Portable => Box::new(PortableSandbox::reattach(base, capsule_dir, settings)?),
    })
}

/// Map a relative working directory into the sandbox root
pub fn resolve_cwd(mount: &Path, cwd: Option<&str>) -> Result<PathBuf> {
    let dir = match cwd {
        None => return Ok(mount.to_path_buf()),
        Some("" | "." | "./" | "/") => mount.to_path_buf(),
        Some(rel) => join_rel(mount, rel)
            .ok_or_else(|| CelError::InvalidRequest(format!("cwd escapes the capsule: {}", rel)))?,
    };
    if !dir.is_dir() {
        return Err(CelError::InvalidRequest(format!(
            "cwd is not a directory inside the capsule: {}",
            dir.display()
        )));
    }
    Ok(dir)
}

pub(crate) fn validate_base(base: &Path) -> Result<()> {
    match fs::read_dir(base) {
        Ok(_) => Ok(()),
        Err(e) => Err(CelError::SandboxCreate(format!(
            "workspace {} is unreadable: {}",
            base.display(),
            e
        ))),
    }
}

/// Classify an IO failure during sandbox creation
pub(crate) fn create_error(context: &str, err: CelError) -> CelError {
    match err {
        CelError::Io(io) if io.raw_os_error() == Some(libc::ENOSPC) => {
            CelError::SandboxCreate(format!("{}: disk space exhausted", context))
        }
        CelError::Io(io) => CelError::SandboxCreate(format!("{}: {}", context, io)),
        other => other,
    }
}

pub(crate) fn run_in(settings: &SandboxSettings, mount: &Path, spec: &ExecSpec) -> Result<RawExecution> {
    let cwd = resolve_cwd(mount, spec.cwd.as_deref())?;
    settings.executor.run(&ExecRequest {
        argv: &spec.argv,
        cwd: &cwd,
        env: &settings.env,
        timeout: spec.timeout,
        stdin: spec.stdin.as_deref(),
    })
}

pub(crate) fn into_result(
    raw: RawExecution,
    read: Vec<String>,
    written: BTreeSet<String>,
) -> ExecutionResult {
    ExecutionResult {
        exit_code: raw.exit_code,
        stdout: raw.stdout,
        stderr: raw.stderr,
        stdout_truncated: raw.stdout_truncated,
        stderr_truncated: raw.stderr_truncated,
        timed_out: raw.timed_out,
        duration_ms: raw.duration_ms,
        usage: raw.usage,
        touched: TouchedPaths {
            read,
            written: written.into_iter().collect(),
        },
    }
}
