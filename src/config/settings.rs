/// Service configuration loaded from JSON
use crate::cel::SandboxSettings;
use crate::config::types::{CelError, Result};
use crate::exec::executor::Executor;
use crate::policy::rule::PolicyRule;
use crate::utils::output::OutputLimits;
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Requested sandbox strategy. `Auto` inspects the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPreference {
    #[default]
    Auto,
    Overlay,
    Snapshot,
    Portable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CelConfig {
    /// Root for capsule directories, witnesses, blobs and backups
    pub storage_root: PathBuf,
    pub sandbox_kind: SandboxPreference,
    pub default_timeout_ms: u64,
    pub deltamin_budget_ms: u64,
    pub output_limits: OutputLimits,
    pub sample_interval_ms: u64,
    /// Poll interval of the snapshot strategy's mtime monitor
    pub monitor_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub cleanup_retry: RetryPolicy,
    /// zstd level for witness blobs
    pub compress_level: i32,
    /// Extra rules seeded on top of the built-in policies
    pub policies: Vec<PolicyRule>,
}

impl Default for CelConfig {
    fn default() -> Self {
        CelConfig {
            storage_root: std::env::temp_dir().join("capsulebox"),
            sandbox_kind: SandboxPreference::Auto,
            default_timeout_ms: 600_000,
            deltamin_budget_ms: 120_000,
            output_limits: OutputLimits::default(),
            sample_interval_ms: 50,
            monitor_interval_ms: 200,
            kill_grace_ms: 200,
            cleanup_retry: RetryPolicy::default(),
            compress_level: 3,
            policies: Vec::new(),
        }
    }
}

impl CelConfig {
    /// Default configuration rooted at `storage_root`
    pub fn with_storage_root<P: Into<PathBuf>>(storage_root: P) -> Self {
        CelConfig {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_content = std::fs::read_to_string(path)
            .map_err(|e| CelError::Config(format!("Failed to read config file: {}", e)))?;

        let config: CelConfig = serde_json::from_str(&config_content)
            .map_err(|e| CelError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Collect every problem and fail with all of them at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.storage_root.as_os_str().is_empty() {
            errors.push("storage_root cannot be empty".to_string());
        }
        for (name, value) in [
            ("default_timeout_ms", self.default_timeout_ms),
            ("deltamin_budget_ms", self.deltamin_budget_ms),
            ("sample_interval_ms", self.sample_interval_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
        ] {
            if value == 0 {
                errors.push(format!("{} cannot be zero", name));
            }
        }
        if self.cleanup_retry.attempts == 0 {
            errors.push("cleanup_retry.attempts cannot be zero".to_string());
        }
        if !(1..=22).contains(&self.compress_level) {
            errors.push(format!(
                "compress_level {} is outside zstd's 1..=22",
                self.compress_level
            ));
        }
        for rule in &self.policies {
            if rule.name.trim().is_empty() {
                errors.push("policy rules need a name".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CelError::Config(format!(
                "Config validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn deltamin_budget(&self) -> Duration {
        Duration::from_millis(self.deltamin_budget_ms)
    }

    pub fn executor(&self) -> Executor {
        Executor::new(
            self.output_limits.clone(),
            Duration::from_millis(self.sample_interval_ms),
            Duration::from_millis(self.kill_grace_ms),
        )
    }

    /// Sandbox settings for a capsule whose commands see `env`
    pub fn sandbox_settings(&self, env: BTreeMap<String, String>) -> SandboxSettings {
        SandboxSettings {
            executor: self.executor(),
            env,
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            cleanup_retry: self.cleanup_retry.clone(),
        }
    }

    pub fn capsules_dir(&self) -> PathBuf {
        self.storage_root.join("capsules")
    }

    pub fn witnesses_dir(&self) -> PathBuf {
        self.storage_root.join("witnesses")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_root.join("blobs")
    }

    pub fn promote_dir(&self) -> PathBuf {
        self.storage_root.join("promote")
    }

    pub fn deltamin_dir(&self) -> PathBuf {
        self.storage_root.join("deltamin")
    }
}
