//! capsulebox: counterfactual execution capsules
//!
//! Commands run inside an isolated capsule over a workspace; their effect is
//! tracked as a change-set that can be inspected, packaged as a replayable
//! witness, minimized, analyzed for independence, and finally promoted onto
//! the real workspace behind named policies.
//!
//! # Architecture
//!
//! ## Counterfactual Execution Layer ([`cel`])
//! - [`cel::overlay`]: overlayfs capsules, upper layer as the change record
//! - [`cel::snapshot`]: directory copy with an mtime monitor for transient files
//! - [`cel::portable`]: directory copy, the fallback everywhere
//! - [`cel::tracker`]: pristine snapshots and content-digest change detection
//!
//! ## Execution ([`exec`], [`kernel`])
//! - [`exec::executor`]: spawn in a fresh process group, timeout, bounded output
//! - [`exec::sampler`]: background `/proc` sampling over a bounded channel
//! - [`kernel::mount`], [`kernel::signal`], [`kernel::procfs`]: thin syscall and `/proc` wrappers
//!
//! ## Engines
//! - [`registry`]: capsule lifecycle and persisted metadata
//! - [`witness`]: content-addressed blob store, manifests, replay
//! - [`policy`]: named promotion rules and reports
//! - [`promote`]: gated all-or-nothing promotion with rollback
//! - [`deltamin`]: failure-preserving change-set minimization
//! - [`commute`]: independent sets and conflicts between changes
//! - [`service`]: the named operation surface
//!
//! ## Support
//! - [`config`]: shared types, errors and [`config::settings::CelConfig`]
//! - [`safety::cleanup`]: idempotent teardown with bounded retry
//! - [`utils`]: hashing, tree walks, diffs, environment hygiene, output capture

// Counterfactual Execution Layer
pub mod cel;

// Execution control and kernel primitives
pub mod exec;
pub mod kernel;

// Engines
pub mod commute;
pub mod deltamin;
pub mod policy;
pub mod promote;
pub mod registry;
pub mod service;
pub mod witness;

// Configuration, safety and utilities
pub mod config;
pub mod safety;
pub mod utils;

pub use cel::{ExecSpec, Sandbox};
pub use config::settings::{CelConfig, SandboxPreference};
pub use config::types::*;
pub use registry::CapsuleRegistry;
pub use service::CapsuleService;
