/// Rule table and evaluation
use super::rule::{PolicyReport, PolicyRule, TestFailure};
use crate::cel::{ExecSpec, Sandbox};
use crate::config::types::{CelError, ChangeSet, ResourceUsage, Result};
use glob::{MatchOptions, Pattern};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

/// Output kept from a failing test command
const TEST_OUTPUT_LIMIT: usize = 4096;

/// Result of one `require_tests` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Where required test commands run
pub trait TestRunner {
    fn run_test(&mut self, command: &str) -> Result<TestOutcome>;

    /// Commands handed to [`TestRunner::run_test`] so far
    fn commands_run(&self) -> &[String] {
        &[]
    }

    /// Change-set of the place the commands ran in, as it stands now. `None`
    /// when no command ran there.
    fn changes_after(&mut self) -> Result<Option<ChangeSet>> {
        Ok(None)
    }
}

/// Runs test commands as `sh -c` inside a capsule's sandbox
pub struct SandboxTestRunner<'a> {
    sandbox: &'a mut dyn Sandbox,
    timeout: Duration,
    ran: Vec<String>,
}

impl<'a> SandboxTestRunner<'a> {
    pub fn new(sandbox: &'a mut dyn Sandbox, timeout: Duration) -> Self {
        SandboxTestRunner {
            sandbox,
            timeout,
            ran: Vec::new(),
        }
    }
}

impl TestRunner for SandboxTestRunner<'_> {
    fn run_test(&mut self, command: &str) -> Result<TestOutcome> {
        self.ran.push(command.to_string());
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let result = self.sandbox.execute(&ExecSpec::new(argv, self.timeout))?;
        let mut output = result.stdout_lossy();
        output.push_str(&result.stderr_lossy());
        Ok(TestOutcome {
            exit_code: result.exit_code,
            output,
        })
    }

    fn commands_run(&self) -> &[String] {
        &self.ran
    }

    fn changes_after(&mut self) -> Result<Option<ChangeSet>> {
        if self.ran.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.sandbox.get_changes()?))
    }
}

/// Runner for evaluations that must not execute anything
pub struct NoTests;

impl TestRunner for NoTests {
    fn run_test(&mut self, command: &str) -> Result<TestOutcome> {
        Err(CelError::InvalidRequest(format!(
            "no capsule available to run test command: {}",
            command
        )))
    }
}

/// Everything a rule is evaluated against
pub struct Evaluation<'a> {
    pub usage: &'a ResourceUsage,
    pub changes: &'a ChangeSet,
    /// `None` when no witness was replayed
    pub replay_ok: Option<bool>,
    /// Directory changed paths would land in
    pub target_root: &'a Path,
}

/// Process-wide rule table, passed explicitly to whoever evaluates
#[derive(Debug)]
pub struct PolicyEngine {
    rules: RwLock<BTreeMap<String, PolicyRule>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    /// Engine seeded with the built-in `baseline` and `strict` rules
    pub fn new() -> Self {
        let mut rules = BTreeMap::new();
        for rule in [PolicyRule::baseline(), PolicyRule::strict()] {
            rules.insert(rule.name.clone(), rule);
        }
        PolicyEngine {
            rules: RwLock::new(rules),
        }
    }

    /// Register or overwrite a rule by name
    pub fn add_policy(&self, rule: PolicyRule) -> Result<()> {
        for pattern in &rule.deny_paths {
            compile(pattern)?;
        }
        let mut rules = self
            .rules
            .write()
            .map_err(|_| CelError::Process("policy table lock poisoned".to_string()))?;
        info!("Registered policy {}", rule.name);
        rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn get_policy(&self, name: &str) -> Result<Option<PolicyRule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| CelError::Process("policy table lock poisoned".to_string()))?;
        Ok(rules.get(name).cloned())
    }

    pub fn policy_names(&self) -> Result<Vec<String>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| CelError::Process("policy table lock poisoned".to_string()))?;
        Ok(rules.keys().cloned().collect())
    }

    /// Resolve every name up front; an unknown name fails the whole call
    pub fn resolve(&self, names: &[String]) -> Result<Vec<PolicyRule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| CelError::Process("policy table lock poisoned".to_string()))?;
        names
            .iter()
            .map(|name| {
                rules
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CelError::UnknownPolicy(name.clone()))
            })
            .collect()
    }

    /// True when any of `names` asks for a successful replay
    pub fn requires_replay(&self, names: &[String]) -> Result<bool> {
        Ok(self.resolve(names)?.iter().any(|r| r.require_replay_ok))
    }

    /// Run every check of every named rule. Nothing short-circuits.
    pub fn evaluate(
        &self,
        names: &[String],
        eval: &Evaluation<'_>,
        tests: &mut dyn TestRunner,
    ) -> Result<PolicyReport> {
        let rules = self.resolve(names)?;
        let mut report = PolicyReport::new();
        let mut test_cache: HashMap<String, TestOutcome> = HashMap::new();

        for rule in &rules {
            check_resources(rule, eval.usage, &mut report);
            check_paths(rule, eval.changes, eval.target_root, &mut report)?;
            check_tests(rule, tests, &mut test_cache, &mut report);
            check_replay(rule, eval.replay_ok, &mut report);
        }

        let report = report.finish();
        debug!(
            "Evaluated policies {:?}: passed={} ({} checks)",
            names,
            report.passed,
            report.checks.len()
        );
        Ok(report)
    }
}

fn check_resources(rule: &PolicyRule, usage: &ResourceUsage, report: &mut PolicyReport) {
    if let Some(max_cpu_ms) = rule.max_cpu_ms {
        report.checks.push(format!("{}:cpu", rule.name));
        if usage.cpu_ms > max_cpu_ms {
            let violation = format!("CPU {}ms exceeds limit {}ms", usage.cpu_ms, max_cpu_ms);
            report.details.push(format!("{}: {}", rule.name, violation));
            report.resource_violations.push(violation);
            report.resource_ok = false;
        }
    }
    if let Some(max_rss_mb) = rule.max_rss_mb {
        report.checks.push(format!("{}:rss", rule.name));
        if usage.rss_max_kb > max_rss_mb.saturating_mul(1024) {
            let violation = format!(
                "RSS {:.1}MB exceeds limit {}MB",
                usage.rss_max_kb as f64 / 1024.0,
                max_rss_mb
            );
            report.details.push(format!("{}: {}", rule.name, violation));
            report.resource_violations.push(violation);
            report.resource_ok = false;
        }
    }
}

fn check_paths(
    rule: &PolicyRule,
    changes: &ChangeSet,
    target_root: &Path,
    report: &mut PolicyReport,
) -> Result<()> {
    if rule.deny_paths.is_empty() {
        return Ok(());
    }
    report.checks.push(format!("{}:paths", rule.name));
    let patterns = rule
        .deny_paths
        .iter()
        .map(|p| compile(p))
        .collect::<Result<Vec<_>>>()?;

    for record in changes {
        let absolute = target_root.join(&record.path);
        let absolute = normalize_separators(&absolute.to_string_lossy());
        let hit = patterns
            .iter()
            .find(|p| matches(p, &record.path) || matches(p, &absolute));
        if let Some(pattern) = hit {
            report.paths_ok = false;
            if !report.deny_paths.contains(&record.path) {
                report.deny_paths.push(record.path.clone());
            }
            report.details.push(format!(
                "{}: {} matches deny pattern {}",
                rule.name,
                record.path,
                pattern.as_str()
            ));
        }
    }
    Ok(())
}

fn check_tests(
    rule: &PolicyRule,
    runner: &mut dyn TestRunner,
    cache: &mut HashMap<String, TestOutcome>,
    report: &mut PolicyReport,
) {
    for command in &rule.require_tests {
        report.checks.push(format!("{}:test:{}", rule.name, command));
        let outcome = match cache.get(command) {
            Some(outcome) => outcome.clone(),
            None => {
                let outcome = runner.run_test(command).unwrap_or_else(|e| {
                    warn!("Test command {:?} could not run: {}", command, e);
                    TestOutcome {
                        exit_code: -1,
                        output: e.to_string(),
                    }
                });
                cache.insert(command.clone(), outcome.clone());
                outcome
            }
        };
        if outcome.exit_code != 0 {
            report.tests_ok = false;
            if report.test_failures.iter().any(|f| &f.command == command) {
                continue;
            }
            report.details.push(format!(
                "{}: test {:?} exited {}",
                rule.name, command, outcome.exit_code
            ));
            report.test_failures.push(TestFailure {
                command: command.clone(),
                exit_code: outcome.exit_code,
                output: tail(&outcome.output, TEST_OUTPUT_LIMIT),
            });
        }
    }
}

fn check_replay(rule: &PolicyRule, replay_ok: Option<bool>, report: &mut PolicyReport) {
    if !rule.require_replay_ok {
        return;
    }
    report.checks.push(format!("{}:replay", rule.name));
    if replay_ok != Some(true) {
        report.replay_ok = false;
        report.details.push(format!("{}: witness replay did not verify", rule.name));
    }
}

/// Compile a deny pattern after `~/` expansion and separator normalization
fn compile(pattern: &str) -> Result<Pattern> {
    let expanded = match (pattern.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => pattern.to_string(),
    };
    Pattern::new(&normalize_separators(&expanded))
        .map_err(|e| CelError::Pattern(format!("{}: {}", pattern, e)))
}

fn matches(pattern: &Pattern, path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    pattern.matches_with(&normalize_separators(path), options)
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
