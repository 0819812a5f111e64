//! Mount management
//!
//! Overlay mounts backing copy-on-write capsules, plus `/proc` checks for
//! mount state.

pub mod overlay;

pub use overlay::{is_mounted, mount_overlay, overlay_supported, unmount};
