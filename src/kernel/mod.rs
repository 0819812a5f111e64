//! Thin wrappers around Linux kernel primitives.

pub mod mount;
pub mod procfs;
pub mod signal;
