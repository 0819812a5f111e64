use crate::config::types::{CelError, Result};
use log::{debug, info};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::Path;

/// True when this process can mount overlayfs: the kernel lists it in
/// `/proc/filesystems` and we hold root.
pub fn overlay_supported() -> bool {
    if unsafe { libc::geteuid() } != 0 {
        return false;
    }
    match fs::read_to_string("/proc/filesystems") {
        Ok(content) => content
            .lines()
            .any(|line| line.split_whitespace().last() == Some("overlay")),
        Err(_) => false,
    }
}

/// Mount `lower` read-only under a writable `upper` at `merged`
pub fn mount_overlay(lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    for dir in [lower, upper, work] {
        let text = dir.to_string_lossy();
        if text.contains(',') || text.contains(':') {
            return Err(CelError::SandboxCreate(format!(
                "overlay layer path contains a reserved character: {}",
                text
            )));
        }
    }

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );

    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| {
        CelError::SandboxCreate(format!("overlay mount at {} failed: {}", merged.display(), e))
    })?;

    info!("Mounted overlay at {} (lower {})", merged.display(), lower.display());
    Ok(())
}

/// Unmount `target`. A target that is not mounted is not an error.
pub fn unmount(target: &Path) -> std::io::Result<()> {
    match umount2(target, MntFlags::empty()) {
        Ok(()) => {
            debug!("Unmounted {}", target.display());
            Ok(())
        }
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
    }
}

/// Check `/proc/mounts` for `path` as a mount point
pub fn is_mounted(path: &Path) -> Result<bool> {
    let mounts = fs::read_to_string("/proc/mounts")
        .map_err(|e| CelError::Process(format!("Failed to read /proc/mounts: {}", e)))?;
    let wanted = path.to_string_lossy();
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| decode_mount_field(mount_point) == wanted))
}

/// Undo the octal escapes the kernel applies to `/proc/mounts` fields
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
