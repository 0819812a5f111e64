/// Directory-copy sandbox, the lowest common denominator
use super::tracker::{written_between, ChangeTracker, TreeSnapshot};
use super::{
    create_error, into_result, run_in, validate_base, ExecSpec, Sandbox, SandboxSettings,
    PRISTINE_FILE,
};
use crate::config::types::{CelError, ChangeSet, ExecutionResult, Result, SandboxKind};
use crate::safety::cleanup;
use crate::utils::retry::RetryPolicy;
use crate::utils::tree::copy_tree;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Private copy of a base directory, shared by the copy-based strategies
#[derive(Debug)]
pub(crate) struct CopyRoot {
    base: PathBuf,
    capsule_dir: PathBuf,
    root: PathBuf,
    tracker: ChangeTracker,
    released: bool,
}

impl CopyRoot {
    pub(crate) fn create(base: &Path, capsule_dir: &Path) -> Result<Self> {
        validate_base(base)?;
        let root = capsule_dir.join("tree");
        fs::create_dir_all(capsule_dir)
            .map_err(|e| create_error("creating capsule directory", e.into()))?;

        let copied = copy_tree(base, &root).map_err(|e| {
            let _ = fs::remove_dir_all(capsule_dir);
            create_error(&format!("copying {}", base.display()), e)
        })?;

        let pristine = TreeSnapshot::capture(&root)?;
        pristine
            .save(&capsule_dir.join(PRISTINE_FILE))
            .map_err(|e| create_error("saving pristine snapshot", e))?;
        info!(
            "Copied {} files from {} into {}",
            copied,
            base.display(),
            root.display()
        );

        Ok(CopyRoot {
            base: base.to_path_buf(),
            capsule_dir: capsule_dir.to_path_buf(),
            root,
            tracker: ChangeTracker::new(pristine),
            released: false,
        })
    }

    pub(crate) fn reattach(base: &Path, capsule_dir: &Path) -> Result<Self> {
        let root = capsule_dir.join("tree");
        if !root.is_dir() {
            return Err(CelError::SandboxCreate(format!(
                "sandbox root {} no longer exists",
                root.display()
            )));
        }
        let pristine = TreeSnapshot::load(&capsule_dir.join(PRISTINE_FILE))?;
        Ok(CopyRoot {
            base: base.to_path_buf(),
            capsule_dir: capsule_dir.to_path_buf(),
            root,
            tracker: ChangeTracker::new(pristine),
            released: false,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn base(&self) -> &Path {
        &self.base
    }

    pub(crate) fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub(crate) fn release(&mut self, retry: &RetryPolicy) -> Result<()> {
        if self.released {
            debug!("{} already released", self.capsule_dir.display());
            return Ok(());
        }
        cleanup::remove_tree(&self.capsule_dir, retry)?;
        self.released = true;
        Ok(())
    }
}

/// Copy isolation with before/after snapshots
#[derive(Debug)]
pub struct PortableSandbox {
    copy: CopyRoot,
    settings: SandboxSettings,
}

impl PortableSandbox {
    pub fn create(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        Ok(PortableSandbox {
            copy: CopyRoot::create(base, capsule_dir)?,
            settings,
        })
    }

    pub fn reattach(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        Ok(PortableSandbox {
            copy: CopyRoot::reattach(base, capsule_dir)?,
            settings,
        })
    }
}

impl Sandbox for PortableSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Portable
    }

    fn mount(&self) -> &Path {
        self.copy.root()
    }

    fn base(&self) -> &Path {
        self.copy.base()
    }

    fn execute(&mut self, spec: &ExecSpec) -> Result<ExecutionResult> {
        let before = TreeSnapshot::capture(self.copy.root())?;
        let raw = run_in(&self.settings, self.copy.root(), spec)?;
        let after = TreeSnapshot::capture(self.copy.root())?;
        // Reads are not observable here; every pre-existing file counts
        let read = before.paths();
        Ok(into_result(raw, read, written_between(&before, &after)))
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
