/// Idempotent sandbox teardown
///
/// Removal may race with file handles held by a process that was just
/// killed. Those failures are retried on the configured backoff schedule and
/// surface as [`CelError::FilesystemLock`] once the attempts run out.
use crate::config::types::{CelError, Result};
use crate::kernel::mount;
use crate::utils::retry::{RetryError, RetryPolicy};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::Path;

/// OS errors that indicate contention rather than a real failure
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::ETXTBSY) | Some(libc::ENOTEMPTY) | Some(libc::EAGAIN)
    )
}

fn lift(path: &Path, outcome: std::result::Result<(), RetryError<io::Error>>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(RetryError::Permanent(e)) => Err(CelError::Io(e)),
        Err(RetryError::Exhausted { attempts, last }) => {
            log::error!(
                "Giving up on {} after {} attempts: {}",
                path.display(),
                attempts,
                last
            );
            Err(CelError::FilesystemLock {
                path: path.to_path_buf(),
                attempts,
            })
        }
    }
}

/// Remove `path` and everything below it. Missing paths are already clean.
pub fn remove_tree(path: &Path, policy: &RetryPolicy) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        debug!("{} already removed", path.display());
        return Ok(());
    }
    let outcome = policy.run(
        |attempt| {
            debug!("Removing {} (attempt {})", path.display(), attempt);
            match fs::remove_dir_all(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        },
        is_transient_io,
    );
    lift(path, outcome)?;
    info!("Removed {}", path.display());
    Ok(())
}

/// Unmount `target`, retrying while it is busy
pub fn unmount(target: &Path, policy: &RetryPolicy) -> Result<()> {
    let outcome = policy.run(|_| mount::unmount(target), is_transient_io);
    lift(target, outcome)
}
