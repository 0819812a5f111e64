//! Safety and cleanup
//!
//! Idempotent release of sandbox roots, retried on transient lock errors.

pub mod cleanup;
