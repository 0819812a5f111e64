/// Policy rules and evaluation reports
use serde::{Deserialize, Serialize};

pub const BASELINE_POLICY: &str = "baseline";
pub const STRICT_POLICY: &str = "strict";

/// Named promotion gate. Every field is optional; an empty rule passes
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu_ms: Option<u64>,
    /// Ceiling in MB, compared against the peak RSS in KB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rss_mb: Option<u64>,
    /// Glob patterns no changed path may match
    pub deny_paths: Vec<String>,
    /// Shell commands that must exit 0 inside the capsule
    pub require_tests: Vec<String>,
    pub require_replay_ok: bool,
}

impl PolicyRule {
    pub fn named(name: &str) -> Self {
        PolicyRule {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// No rules at all
    pub fn baseline() -> Self {
        Self::named(BASELINE_POLICY)
    }

    pub fn strict() -> Self {
        PolicyRule {
            name: STRICT_POLICY.to_string(),
            max_cpu_ms: Some(300_000),
            max_rss_mb: Some(2048),
            deny_paths: vec![
                ".git/*".to_string(),
                "**/.env".to_string(),
                "~/.ssh/*".to_string(),
            ],
            require_tests: Vec::new(),
            require_replay_ok: false,
        }
    }

    /// Build a rule from a `policy/set` body. The name argument wins over any
    /// name inside `rules`.
    pub fn from_value(name: &str, rules: serde_json::Value) -> serde_json::Result<Self> {
        let mut rule: PolicyRule = serde_json::from_value(rules)?;
        rule.name = name.to_string();
        Ok(rule)
    }
}

/// Failed `require_tests` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
}

/// Outcome of evaluating one or more rules. Every check runs even after
/// an earlier one fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub passed: bool,
    pub resource_ok: bool,
    pub paths_ok: bool,
    pub tests_ok: bool,
    pub replay_ok: bool,
    /// Names of the checks that were evaluated
    pub checks: Vec<String>,
    /// Changed paths that matched a deny pattern
    pub deny_paths: Vec<String>,
    pub resource_violations: Vec<String>,
    pub test_failures: Vec<TestFailure>,
    /// Human-readable violations, one per line
    pub details: Vec<String>,
}

impl PolicyReport {
    pub(crate) fn new() -> Self {
        PolicyReport {
            passed: true,
            resource_ok: true,
            paths_ok: true,
            tests_ok: true,
            replay_ok: true,
            ..Default::default()
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.passed = self.resource_ok && self.paths_ok && self.tests_ok && self.replay_ok;
        self
    }
}
