/// Directory-copy sandbox with live mtime monitoring
///
/// Full snapshots around each execution miss files that are created and
/// removed while the command runs. A monitor thread polls sizes and mtimes
/// during the execution and reports every path it saw change.
use super::portable::CopyRoot;
use super::tracker::{written_between, TreeSnapshot};
use super::{into_result, run_in, ExecSpec, Sandbox, SandboxSettings};
use crate::config::types::{ChangeSet, ExecutionResult, Result, SandboxKind};
use crate::utils::tree::walk_files;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct TransientMonitor {
    stop: Sender<()>,
    handle: JoinHandle<BTreeSet<String>>,
}

impl TransientMonitor {
    fn start(root: PathBuf, baseline: HashMap<String, (u64, i64)>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let mut seen = BTreeSet::new();
            loop {
                if let Ok(entries) = walk_files(&root) {
                    for entry in entries {
                        if baseline.get(&entry.rel) != Some(&(entry.size, entry.mtime_ns)) {
                            seen.insert(entry.rel);
                        }
                    }
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            seen
        });
        TransientMonitor {
            stop: stop_tx,
            handle,
        }
    }

    fn finish(self) -> BTreeSet<String> {
        let _ = self.stop.send(());
        self.handle.join().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct SnapshotSandbox {
    copy: CopyRoot,
    settings: SandboxSettings,
}

impl SnapshotSandbox {
    pub fn create(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        Ok(SnapshotSandbox {
            copy: CopyRoot::create(base, capsule_dir)?,
            settings,
        })
    }

    pub fn reattach(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        Ok(SnapshotSandbox {
            copy: CopyRoot::reattach(base, capsule_dir)?,
            settings,
        })
    }
}

impl Sandbox for SnapshotSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Snapshot
    }

    fn mount(&self) -> &Path {
        self.copy.root()
    }

    fn base(&self) -> &Path {
        self.copy.base()
    }

    fn execute(&mut self, spec: &ExecSpec) -> Result<ExecutionResult> {
        let before = TreeSnapshot::capture(self.copy.root())?;
        let baseline = before
            .files
            .iter()
            .map(|(path, state)| (path.clone(), (state.size, state.mtime_ns)))
            .collect();
        let monitor = TransientMonitor::start(
            self.copy.root().to_path_buf(),
            baseline,
            self.settings.monitor_interval,
        );

        let raw = run_in(&self.settings, self.copy.root(), spec);
        let transient = monitor.finish();
        let raw = raw?;

        let after = TreeSnapshot::capture(self.copy.root())?;
        let mut written = written_between(&before, &after);
        let extra = transient.difference(&written).count();
        if extra > 0 {
            debug!("Monitor caught {} transient paths", extra);
        }
        written.extend(transient);

        Ok(into_result(raw, before.paths(), written))
    }

    fn get_changes(&self) -> Result<ChangeSet> {
        self.copy.tracker().changes_in(self.copy.root())
    }

    fn pristine(&self) -> &TreeSnapshot {
        self.copy.tracker().pristine()
    }

    fn cleanup(&mut self) -> Result<()> {
        self.copy.release(&self.settings.cleanup_retry)
    }
}
