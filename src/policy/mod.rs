//! Promotion policies
//!
//! Named rules live in a [`PolicyEngine`] handed explicitly to the registry
//! and the promotion path. Evaluation never throws on a violation: the
//! outcome is always a [`PolicyReport`].

pub mod engine;
pub mod rule;

pub use engine::{Evaluation, NoTests, PolicyEngine, SandboxTestRunner, TestOutcome, TestRunner};
pub use rule::{PolicyReport, PolicyRule, TestFailure, BASELINE_POLICY, STRICT_POLICY};
