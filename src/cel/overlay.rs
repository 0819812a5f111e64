/// Overlayfs sandbox
///
/// The base directory is the lower layer and is never written. Everything a
/// command does lands in the upper layer, so change detection only has to
/// look there.
use super::tracker::{scan_upper, upper_written_between, ChangeTracker, TreeSnapshot};
use super::{
    create_error, into_result, run_in, validate_base, ExecSpec, Sandbox, SandboxSettings,
    PRISTINE_FILE,
};
use crate::config::types::{CelError, ChangeSet, ExecutionResult, Result, SandboxKind};
use crate::kernel::mount::{is_mounted, mount_overlay, overlay_supported};
use crate::safety::cleanup;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct OverlaySandbox {
    lower: PathBuf,
    capsule_dir: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    merged: PathBuf,
    tracker: ChangeTracker,
    mounted: bool,
    released: bool,
    settings: SandboxSettings,
}

impl OverlaySandbox {
    pub fn create(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        if !overlay_supported() {
            return Err(CelError::SandboxCreate(
                "overlayfs is not available to this process".to_string(),
            ));
        }
        validate_base(base)?;

        let upper = capsule_dir.join("upper");
        let work = capsule_dir.join("work");
        let merged = capsule_dir.join("merged");
        for dir in [&upper, &work, &merged] {
            fs::create_dir_all(dir)
                .map_err(|e| create_error("creating overlay directories", e.into()))?;
        }

        let pristine = TreeSnapshot::capture(base)?;
        pristine
            .save(&capsule_dir.join(PRISTINE_FILE))
            .map_err(|e| create_error("saving pristine snapshot", e))?;

        if let Err(e) = mount_overlay(base, &upper, &work, &merged) {
            let _ = fs::remove_dir_all(capsule_dir);
            return Err(e);
        }

        Ok(OverlaySandbox {
            lower: base.to_path_buf(),
            capsule_dir: capsule_dir.to_path_buf(),
            upper,
            work,
            merged,
            tracker: ChangeTracker::new(pristine),
            mounted: true,
            released: false,
            settings,
        })
    }

    pub fn reattach(base: &Path, capsule_dir: &Path, settings: SandboxSettings) -> Result<Self> {
        let merged = capsule_dir.join("merged");
        if !is_mounted(&merged)? {
            return Err(CelError::SandboxCreate(format!(
                "overlay at {} is no longer mounted",
                merged.display()
            )));
        }
        let pristine = TreeSnapshot::load(&capsule_dir.join(PRISTINE_FILE))?;
        Ok(OverlaySandbox {
            lower: base.to_path_buf(),
            capsule_dir: capsule_dir.to_path_buf(),
            upper: capsule_dir.join("upper"),
            work: capsule_dir.join("work"),
            merged,
            tracker: ChangeTracker::new(pristine),
            mounted: true,
            released: false,
            settings,
        })
    }
}

impl Sandbox for OverlaySandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Overlay
    }

    fn mount(&self) -> &Path {
        &self.merged
    }

    fn base(&self) -> &Path {
        &self.lower
    }

    fn execute(&mut self, spec: &ExecSpec) -> Result<ExecutionResult> {
        let before = scan_upper(&self.upper)?;
        let raw = run_in(&self.settings, &self.merged, spec)?;
        let after = scan_upper(&self.upper)?;
        // Lower-layer reads leave no trace in the upper directory
        Ok(into_result(raw, Vec::new(), upper_written_between(&before, &after)))
    }

    fn get_changes(&self) -> Result<ChangeSet> {
        Ok(self.tracker.changes_from_upper(&scan_upper(&self.upper)?))
    }

    fn pristine(&self) -> &TreeSnapshot {
        self.tracker.pristine()
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.released {
            debug!("{} already released", self.capsule_dir.display());
            return Ok(());
        }
        if self.mounted {
            cleanup::unmount(&self.merged, &self.settings.cleanup_retry)?;
            self.mounted = false;
        }
        cleanup::remove_tree(&self.capsule_dir, &self.settings.cleanup_retry)?;
        self.released = true;
        info!("Released overlay {} (work {})", self.merged.display(), self.work.display());
        Ok(())
    }
}
