//! Named operation surface.
//!
//! [`CapsuleService`] wires the registry and engines together from one
//! [`CelConfig`] and exposes every operation twice: as a typed method, and
//! through [`CapsuleService::call`] which takes the operation name and JSON
//! parameters. Framing and transport live outside this crate.

use crate::cel::ExecSpec;
use crate::commute::{analyze, changes_from_history, CommutativityReport};
use crate::config::settings::CelConfig;
use crate::config::types::{CapsuleMetadata, CelError, ResourceUsage, Result, TouchedPaths};
use crate::deltamin::{CandidateRunner, DeltaMinimizer, FailurePredicate, ScratchRunner};
use crate::policy::{PolicyEngine, PolicyRule, SandboxTestRunner};
use crate::promote::{PromoteEngine, PromoteRequest, PromoteResult};
use crate::registry::{CapsuleRegistry, CreateOptions};
use crate::utils::diff::{self, DiffFormat, DiffSummary};
use crate::utils::env_hygiene::EnvHygiene;
use crate::utils::hashing::Digest;
use crate::witness::manifest::root_of;
use crate::witness::{Compression, ReplayReport, WitnessEngine, WitnessInfo, WitnessOptions};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParams {
    pub workspace: PathBuf,
    #[serde(default)]
    pub base: Option<PathBuf>,
    #[serde(default)]
    pub clock_offset_sec: i64,
    #[serde(default)]
    pub env_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResponse {
    pub capsule_id: String,
    pub mount: PathBuf,
    pub clock: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecParams {
    pub capsule_id: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub usage: ResourceUsage,
    pub touched: TouchedPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffParams {
    pub capsule_id: String,
    #[serde(default)]
    pub format: DiffFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResponse {
    pub summary: DiffSummary,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessParams {
    pub capsule_id: String,
    #[serde(default)]
    pub compress: Compression,
    #[serde(default)]
    pub include_blobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayParams {
    pub witness_id: String,
}

fn default_policies() -> Vec<String> {
    vec![crate::policy::BASELINE_POLICY.to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteParams {
    pub capsule_id: String,
    #[serde(default = "default_policies")]
    pub policies: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaminParams {
    pub capsule_id: String,
    /// Command whose failure is being narrowed down
    pub argv: Vec<String>,
    #[serde(default)]
    pub predicate: FailurePredicate,
    #[serde(default)]
    pub budget_ms: Option<u64>,
    /// Per-candidate command timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaminResponse {
    pub minimal: Vec<String>,
    pub minimal_patch: String,
    pub replay_ok: bool,
    pub root_digest: Digest,
    pub completed: bool,
    pub iterations: usize,
    pub evaluations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleParams {
    pub capsule_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySetParams {
    pub name: String,
    #[serde(default)]
    pub rules: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySetResponse {
    pub ok: bool,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

pub struct CapsuleService {
    registry: CapsuleRegistry,
    policies: Arc<PolicyEngine>,
    witnesses: WitnessEngine,
    promoter: PromoteEngine,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| CelError::InvalidRequest(e.to_string()))
}

fn respond<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl CapsuleService {
    pub fn new(config: CelConfig) -> Result<Self> {
        let registry = CapsuleRegistry::new(config)?;
        let config = registry.config();

        let policies = Arc::new(PolicyEngine::new());
        for rule in &config.policies {
            policies.add_policy(rule.clone())?;
        }
        let witnesses =
            WitnessEngine::new(&config.witnesses_dir(), &config.blobs_dir(), config.compress_level)?;
        let promoter = PromoteEngine::new(Arc::clone(&policies), &config.promote_dir());

        info!(
            "Capsule service ready at {} ({} policies)",
            config.storage_root.display(),
            policies.policy_names()?.len()
        );
        Ok(CapsuleService {
            registry,
            policies,
            witnesses,
            promoter,
        })
    }

    pub fn registry(&self) -> &CapsuleRegistry {
        &self.registry
    }

    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn witnesses(&self) -> &WitnessEngine {
        &self.witnesses
    }

    /// Dispatch one named operation
    pub fn call(&self, operation: &str, params: Value) -> Result<Value> {
        match operation {
            "capsule/create" => respond(self.create(parse(params)?)?),
            "capsule/exec" => respond(self.exec(parse(params)?)?),
            "capsule/diff" => respond(self.diff(parse(params)?)?),
            "capsule/witness" => respond(self.witness(parse(params)?)?),
            "capsule/replay" => respond(self.replay(parse(params)?)?),
            "capsule/promote" => respond(self.promote(parse(params)?)?),
            "capsule/deltamin" => respond(self.deltamin(parse(params)?)?),
            "capsule/commutativity" => respond(self.commutativity(parse(params)?)?),
            "capsule/list" => respond(self.list()?),
            "capsule/delete" => respond(self.delete(parse(params)?)?),
            "policy/set" => respond(self.set_policy(parse(params)?)?),
            other => Err(CelError::UnknownOperation(other.to_string())),
        }
    }

    pub fn create(&self, params: CreateParams) -> Result<CreateResponse> {
        let metadata = self.registry.create(CreateOptions {
            workspace: params.workspace,
            base: params.base,
            clock_offset_sec: params.clock_offset_sec,
            env_whitelist: params.env_whitelist,
        })?;
        Ok(CreateResponse {
            capsule_id: metadata.capsule_id,
            mount: metadata.mount,
            clock: metadata.created_at,
        })
    }

    pub fn exec(&self, params: ExecParams) -> Result<ExecResponse> {
        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.registry.config().default_timeout());
        let mut spec = ExecSpec::new(params.argv, timeout);
        spec.cwd = params.cwd;
        spec.stdin = params.stdin.map(String::into_bytes);

        let result = self.registry.execute(&params.capsule_id, spec)?;
        Ok(ExecResponse {
            exit_code: result.exit_code,
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
            timed_out: result.timed_out,
            duration_ms: result.duration_ms,
            usage: result.usage,
            touched: result.touched,
        })
    }

    pub fn diff(&self, params: DiffParams) -> Result<DiffResponse> {
        let (summary, diff) = self.registry.with_capsule(&params.capsule_id, |entry| {
            let changes = entry.sandbox.get_changes()?;
            diff::render(
                entry.sandbox.base(),
                entry.sandbox.mount(),
                changes.iter(),
                params.format,
            )
        })?;
        Ok(DiffResponse { summary, diff })
    }

    pub fn witness(&self, params: WitnessParams) -> Result<WitnessInfo> {
        let options = WitnessOptions {
            compress: params.compress,
            include_blobs: params.include_blobs,
        };
        self.registry.with_capsule(&params.capsule_id, |entry| {
            let changes = entry.sandbox.get_changes()?;
            let usage = last_usage(entry.last_execution.as_ref().map(|r| r.usage));
            self.witnesses.create(
                &entry.metadata.capsule_id,
                &entry.metadata.created_at,
                entry.sandbox.mount(),
                &changes,
                options,
                usage,
            )
        })
    }

    pub fn replay(&self, params: ReplayParams) -> Result<ReplayReport> {
        self.witnesses.replay(&params.witness_id)
    }

    /// Gate and apply the capsule's changes onto its workspace. Required test
    /// commands run inside the capsule; a witness is packaged and replayed
    /// only when a selected rule asks for it.
    pub fn promote(&self, params: PromoteParams) -> Result<PromoteResult> {
        let needs_replay = self.policies.requires_replay(&params.policies)?;
        let timeout = self.registry.config().default_timeout();

        self.registry.with_capsule(&params.capsule_id, |entry| {
            let changes = entry.sandbox.get_changes()?;
            let usage = last_usage(entry.last_execution.as_ref().map(|r| r.usage));
            let mount = entry.sandbox.mount().to_path_buf();
            let target = entry.metadata.workspace.clone();

            let replay_ok = if needs_replay {
                let info = self.witnesses.create(
                    &entry.metadata.capsule_id,
                    &entry.metadata.created_at,
                    &mount,
                    &changes,
                    WitnessOptions::default(),
                    usage,
                )?;
                Some(self.witnesses.replay(&info.witness_id)?.replay_ok)
            } else {
                None
            };

            let mut tests = SandboxTestRunner::new(entry.sandbox.as_mut(), timeout);
            self.promoter.promote(
                &PromoteRequest {
                    mount: &mount,
                    target: &target,
                    changes: &changes,
                    policies: &params.policies,
                    usage: &usage,
                    replay_ok,
                    dry_run: params.dry_run,
                },
                &mut tests,
            )
        })
    }

    /// Narrow the capsule's change-set down to a subset that still makes
    /// `argv` fail. Candidates run in throwaway sandboxes over the capsule's
    /// base; the capsule itself is left untouched.
    pub fn deltamin(&self, params: DeltaminParams) -> Result<DeltaminResponse> {
        if params.argv.is_empty() {
            return Err(CelError::InvalidRequest("argv must not be empty".to_string()));
        }
        let config = self.registry.config();
        let budget = params
            .budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.deltamin_budget());
        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.default_timeout());

        self.registry.with_capsule(&params.capsule_id, |entry| {
            let changes = entry.sandbox.get_changes()?;
            let env = EnvHygiene::new(
                entry.metadata.env_whitelist.clone(),
                entry.metadata.clock_offset_sec,
            )
            .build_environment();
            let base = entry.sandbox.base();
            let mount = entry.sandbox.mount();

            let mut runner = ScratchRunner {
                preference: config.sandbox_kind,
                base,
                source: mount,
                scratch_root: config.deltamin_dir(),
                settings: config.sandbox_settings(env),
                command: ExecSpec::new(params.argv.clone(), timeout),
                predicate: params.predicate.clone(),
            };
            let outcome = DeltaMinimizer::new(budget).minimize(changes.records(), &mut runner)?;
            let replay_ok = runner.reproduces(&outcome.minimal)?;
            let (_, minimal_patch) =
                diff::render(base, mount, outcome.minimal.iter(), DiffFormat::Unified)?;

            Ok(DeltaminResponse {
                minimal: outcome.minimal.iter().map(|r| r.path.clone()).collect(),
                minimal_patch,
                replay_ok,
                root_digest: root_of(&outcome.minimal),
                completed: outcome.completed,
                iterations: outcome.iterations,
                evaluations: outcome.evaluations,
            })
        })
    }

    pub fn commutativity(&self, params: CapsuleParams) -> Result<CommutativityReport> {
        self.registry.with_capsule(&params.capsule_id, |entry| {
            let changes = entry.sandbox.get_changes()?;
            Ok(analyze(changes_from_history(&entry.history, &changes)))
        })
    }

    pub fn list(&self) -> Result<Vec<CapsuleMetadata>> {
        self.registry.list()
    }

    pub fn delete(&self, params: CapsuleParams) -> Result<DeleteResponse> {
        Ok(DeleteResponse {
            deleted: self.registry.delete(&params.capsule_id)?,
        })
    }

    pub fn set_policy(&self, params: PolicySetParams) -> Result<PolicySetResponse> {
        let rules = match params.rules {
            Value::Null => Value::Object(Default::default()),
            rules => rules,
        };
        let rule = PolicyRule::from_value(&params.name, rules)
            .map_err(|e| CelError::InvalidRequest(format!("policy {}: {}", params.name, e)))?;
        self.policies.add_policy(rule)?;
        Ok(PolicySetResponse {
            ok: true,
            name: params.name,
        })
    }

    /// Delete every capsule
    pub fn shutdown(&self) -> Result<()> {
        self.registry.teardown()
    }
}

fn last_usage(usage: Option<ResourceUsage>) -> ResourceUsage {
    usage.unwrap_or_default()
}
