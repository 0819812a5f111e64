//! Capsule lifecycle.
//!
//! The registry owns every live sandbox and is the only writer of capsule
//! metadata. Operations on one capsule are serialized by a per-capsule
//! mutex; different capsules run concurrently.

use crate::cel::{create_sandbox, reattach_sandbox, ExecSpec, Sandbox};
use crate::config::settings::CelConfig;
use crate::config::types::{
    CapsuleMetadata, CapsuleState, CelError, ChangeSet, ExecutionResult, Result,
};
use crate::utils::env_hygiene::EnvHygiene;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

pub const CAPSULE_TABLE_FILE: &str = "capsules.json";

/// Largest accepted clock offset, about a century either way
const MAX_CLOCK_OFFSET_SEC: i64 = 100 * 365 * 86_400;

/// Parameters of `capsule/create`
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub workspace: PathBuf,
    /// Lower layer; defaults to `workspace`
    pub base: Option<PathBuf>,
    pub clock_offset_sec: i64,
    pub env_whitelist: Vec<String>,
}

/// Paths one execution wrote, kept for commutativity analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    /// 1-based execution number within the capsule
    pub index: usize,
    pub argv: Vec<String>,
    pub written: Vec<String>,
}

pub struct CapsuleEntry {
    pub metadata: CapsuleMetadata,
    pub sandbox: Box<dyn Sandbox>,
    pub last_execution: Option<ExecutionResult>,
    pub history: Vec<ExecRecord>,
}

type SharedEntry = Arc<Mutex<CapsuleEntry>>;

pub struct CapsuleRegistry {
    config: CelConfig,
    capsules: RwLock<HashMap<String, SharedEntry>>,
    /// Persisted view of every active capsule's metadata
    table: Mutex<BTreeMap<String, CapsuleMetadata>>,
}

fn poisoned(what: &str) -> CelError {
    CelError::Process(format!("{} lock poisoned", what))
}

/// Creation time shifted by the capsule's clock offset
pub fn effective_clock(offset_sec: i64) -> String {
    (Utc::now() + ChronoDuration::seconds(offset_sec)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl CapsuleRegistry {
    /// Open the registry at the configured storage root, re-attaching
    /// capsules left by an earlier instance whose sandbox survived
    pub fn new(config: CelConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(config.capsules_dir())?;

        let table_path = config.storage_root.join(CAPSULE_TABLE_FILE);
        let stored: BTreeMap<String, CapsuleMetadata> = if table_path.is_file() {
            serde_json::from_slice(&fs::read(&table_path)?)?
        } else {
            BTreeMap::new()
        };

        let mut capsules = HashMap::new();
        let mut table = BTreeMap::new();
        for (id, metadata) in stored {
            if metadata.state != CapsuleState::Active {
                continue;
            }
            let settings = config.sandbox_settings(
                EnvHygiene::new(metadata.env_whitelist.clone(), metadata.clock_offset_sec)
                    .build_environment(),
            );
            match reattach_sandbox(
                metadata.sandbox_kind,
                &metadata.base,
                &metadata.capsule_dir,
                settings,
            ) {
                Ok(sandbox) => {
                    info!("Re-attached capsule {} ({})", id, metadata.sandbox_kind);
                    table.insert(id.clone(), metadata.clone());
                    capsules.insert(
                        id,
                        Arc::new(Mutex::new(CapsuleEntry {
                            metadata,
                            sandbox,
                            last_execution: None,
                            history: Vec::new(),
                        })),
                    );
                }
                Err(e) => warn!("Dropping capsule {}: {}", id, e),
            }
        }

        let registry = CapsuleRegistry {
            config,
            capsules: RwLock::new(capsules),
            table: Mutex::new(table),
        };
        registry.persist()?;
        Ok(registry)
    }

    pub fn config(&self) -> &CelConfig {
        &self.config
    }

    fn persist(&self) -> Result<()> {
        let table = self.table.lock().map_err(|_| poisoned("capsule table"))?;
        let path = self.config.storage_root.join(CAPSULE_TABLE_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&*table)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn create(&self, options: CreateOptions) -> Result<CapsuleMetadata> {
        if options.clock_offset_sec.abs() > MAX_CLOCK_OFFSET_SEC {
            return Err(CelError::InvalidRequest(format!(
                "clock offset {}s is out of range",
                options.clock_offset_sec
            )));
        }
        let workspace = canonical(&options.workspace, "workspace")?;
        let base = match &options.base {
            Some(base) => canonical(base, "base")?,
            None => workspace.clone(),
        };

        let capsule_id = format!("cap_{}", Uuid::now_v7().simple());
        let capsule_dir = self.config.capsules_dir().join(&capsule_id);
        let env = EnvHygiene::new(options.env_whitelist.clone(), options.clock_offset_sec)
            .build_environment();
        let sandbox = create_sandbox(
            self.config.sandbox_kind,
            &base,
            &capsule_dir,
            self.config.sandbox_settings(env),
        )?;

        let metadata = CapsuleMetadata {
            capsule_id: capsule_id.clone(),
            workspace,
            base,
            mount: sandbox.mount().to_path_buf(),
            capsule_dir,
            sandbox_kind: sandbox.kind(),
            created_at: effective_clock(options.clock_offset_sec),
            clock_offset_sec: options.clock_offset_sec,
            env_whitelist: options.env_whitelist,
            state: CapsuleState::Active,
        };

        self.table
            .lock()
            .map_err(|_| poisoned("capsule table"))?
            .insert(capsule_id.clone(), metadata.clone());
        self.capsules
            .write()
            .map_err(|_| poisoned("registry"))?
            .insert(
                capsule_id.clone(),
                Arc::new(Mutex::new(CapsuleEntry {
                    metadata: metadata.clone(),
                    sandbox,
                    last_execution: None,
                    history: Vec::new(),
                })),
            );
        self.persist()?;

        info!(
            "Created capsule {} ({}) over {}",
            capsule_id,
            metadata.sandbox_kind,
            metadata.base.display()
        );
        Ok(metadata)
    }

    fn entry(&self, capsule_id: &str) -> Result<SharedEntry> {
        self.capsules
            .read()
            .map_err(|_| poisoned("registry"))?
            .get(capsule_id)
            .cloned()
            .ok_or_else(|| CelError::CapsuleNotFound(capsule_id.to_string()))
    }

    /// Run `f` with exclusive access to one capsule
    pub fn with_capsule<T, F>(&self, capsule_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut CapsuleEntry) -> Result<T>,
    {
        let shared = self.entry(capsule_id)?;
        let mut entry = shared.lock().map_err(|_| poisoned("capsule"))?;
        if entry.metadata.state != CapsuleState::Active {
            return Err(CelError::CapsuleNotFound(capsule_id.to_string()));
        }
        f(&mut entry)
    }

    pub fn metadata(&self, capsule_id: &str) -> Result<CapsuleMetadata> {
        self.with_capsule(capsule_id, |entry| Ok(entry.metadata.clone()))
    }

    /// Run a command in the capsule. An absolute `cwd` inside the workspace
    /// or the mount is mapped to the matching sandbox directory.
    pub fn execute(&self, capsule_id: &str, mut spec: ExecSpec) -> Result<ExecutionResult> {
        if spec.argv.is_empty() {
            return Err(CelError::InvalidRequest("argv must not be empty".to_string()));
        }
        self.with_capsule(capsule_id, |entry| {
            if let Some(cwd) = spec.cwd.take() {
                spec.cwd = Some(relative_cwd(&entry.metadata, &cwd)?);
            }
            let result = entry.sandbox.execute(&spec)?;
            let index = entry.history.len() + 1;
            entry.history.push(ExecRecord {
                index,
                argv: spec.argv.clone(),
                written: result.touched.written.clone(),
            });
            entry.last_execution = Some(result.clone());
            info!(
                "Capsule {} exec #{} {:?}: exit {} in {}ms",
                capsule_id, index, spec.argv, result.exit_code, result.duration_ms
            );
            Ok(result)
        })
    }

    pub fn changes(&self, capsule_id: &str) -> Result<ChangeSet> {
        self.with_capsule(capsule_id, |entry| entry.sandbox.get_changes())
    }

    /// Metadata of every active capsule, oldest first
    pub fn list(&self) -> Result<Vec<CapsuleMetadata>> {
        let table = self.table.lock().map_err(|_| poisoned("capsule table"))?;
        Ok(table.values().cloned().collect())
    }

    /// Clean up and forget a capsule. Unknown ids return `false`.
    pub fn delete(&self, capsule_id: &str) -> Result<bool> {
        let shared = match self.entry(capsule_id) {
            Ok(shared) => shared,
            Err(CelError::CapsuleNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        {
            let mut entry = shared.lock().map_err(|_| poisoned("capsule"))?;
            if entry.metadata.state == CapsuleState::Deleted {
                return Ok(false);
            }
            entry.sandbox.cleanup()?;
            entry.metadata.state = CapsuleState::Deleted;
        }

        self.capsules
            .write()
            .map_err(|_| poisoned("registry"))?
            .remove(capsule_id);
        self.table
            .lock()
            .map_err(|_| poisoned("capsule table"))?
            .remove(capsule_id);
        self.persist()?;
        info!("Deleted capsule {}", capsule_id);
        Ok(true)
    }

    /// Delete every capsule. Keeps going past failures and reports the first.
    pub fn teardown(&self) -> Result<()> {
        let ids: Vec<String> = self
            .capsules
            .read()
            .map_err(|_| poisoned("registry"))?
            .keys()
            .cloned()
            .collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.delete(&id) {
                error!("Teardown of capsule {} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn canonical(path: &Path, what: &str) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| {
        CelError::SandboxCreate(format!("{} {} is unreadable: {}", what, path.display(), e))
    })
}

fn relative_cwd(metadata: &CapsuleMetadata, cwd: &str) -> Result<String> {
    let path = Path::new(cwd);
    if !path.is_absolute() {
        return Ok(cwd.to_string());
    }
    for root in [&metadata.mount, &metadata.workspace, &metadata.base] {
        if let Ok(rel) = path.strip_prefix(root) {
            return Ok(rel.to_string_lossy().into_owned());
        }
    }
    Err(CelError::InvalidRequest(format!(
        "cwd {} is outside the capsule workspace",
        cwd
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::SandboxPreference;
    use crate::config::types::ChangeKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(storage: &Path) -> CelConfig {
        let mut config = CelConfig::with_storage_root(storage);
        config.sandbox_kind = SandboxPreference::Portable;
        config.sample_interval_ms = 20;
        config.cleanup_retry.initial_backoff_ms = 1;
        config
    }

    fn sh(script: &str) -> ExecSpec {
        ExecSpec::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(20),
        )
    }

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test.txt"), "Original content").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    #[test]
    fn test_create_execute_and_track() {
        let ws = workspace();
        let storage = TempDir::new().unwrap();
        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();

        let meta = registry
            .create(CreateOptions {
                workspace: ws.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap();
        assert!(meta.capsule_id.starts_with("cap_"));
        assert!(meta.mount.starts_with(storage.path()));

        let result = registry
            .execute(&meta.capsule_id, sh("printf 'Modified content' > test.txt"))
            .unwrap();
        assert_eq!(result.exit_code, 0);

        let changes = registry.changes(&meta.capsule_id).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.records()[0].kind, ChangeKind::Modified);

        registry
            .with_capsule(&meta.capsule_id, |entry| {
                assert_eq!(entry.history.len(), 1);
                assert_eq!(entry.history[0].written, vec!["test.txt"]);
                assert!(entry.last_execution.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unknown_capsule() {
        let storage = TempDir::new().unwrap();
        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
        assert!(matches!(
            registry.changes("cap_missing"),
            Err(CelError::CapsuleNotFound(_))
        ));
        assert!(!registry.delete("cap_missing").unwrap());
    }

    #[test]
    fn test_unreadable_workspace_registers_nothing() {
        let storage = TempDir::new().unwrap();
        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
        let result = registry.create(CreateOptions {
            workspace: storage.path().join("missing"),
            ..Default::default()
        });
        assert!(matches!(result, Err(CelError::SandboxCreate(_))));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_absolute_cwd_maps_into_sandbox() {
        let ws = workspace();
        let storage = TempDir::new().unwrap();
        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
        let meta = registry
            .create(CreateOptions {
                workspace: ws.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap();

        let mut spec = sh("pwd");
        spec.cwd = Some(meta.workspace.join("sub").to_string_lossy().into_owned());
        let result = registry.execute(&meta.capsule_id, spec).unwrap();
        assert_eq!(
            result.stdout_lossy().trim(),
            meta.mount.join("sub").to_string_lossy()
        );

        let mut outside = sh("pwd");
        outside.cwd = Some("/".to_string());
        assert!(matches!(
            registry.execute(&meta.capsule_id, outside),
            Err(CelError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_clock_offset_is_applied_and_exported() {
        let ws = workspace();
        let storage = TempDir::new().unwrap();
        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
        let meta = registry
            .create(CreateOptions {
                workspace: ws.path().to_path_buf(),
                clock_offset_sec: 86_400,
                ..Default::default()
            })
            .unwrap();

        let created = chrono::DateTime::parse_from_rfc3339(&meta.created_at).unwrap();
        assert!(created.with_timezone(&Utc) > Utc::now() + ChronoDuration::hours(23));

        let result = registry
            .execute(&meta.capsule_id, sh("echo $CAPSULE_CLOCK_OFFSET"))
            .unwrap();
        assert_eq!(result.stdout_lossy().trim(), "86400");
    }

    #[test]
    fn test_new_registry_reattaches_and_delete_forgets() {
        let ws = workspace();
        let storage = TempDir::new().unwrap();
        let id = {
            let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
            let meta = registry
                .create(CreateOptions {
                    workspace: ws.path().to_path_buf(),
                    ..Default::default()
                })
                .unwrap();
            registry
                .execute(&meta.capsule_id, sh("echo hi > new.txt"))
                .unwrap();
            meta.capsule_id
        };

        let registry = CapsuleRegistry::new(config(storage.path())).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.changes(&id).unwrap().paths(), vec!["new.txt"]);

        assert!(registry.delete(&id).unwrap());
        assert!(!registry.delete(&id).unwrap());
        assert!(registry.list().unwrap().is_empty());

        let reopened = CapsuleRegistry::new(config(storage.path())).unwrap();
        assert!(reopened.list().unwrap().is_empty());
    }

    #[test]
    fn test_capsules_execute_concurrently() {
        let ws = workspace();
        let storage = TempDir::new().unwrap();
        let registry = Arc::new(CapsuleRegistry::new(config(storage.path())).unwrap());
        let ids: Vec<String> = (0..3)
            .map(|_| {
                registry
                    .create(CreateOptions {
                        workspace: ws.path().to_path_buf(),
                        ..Default::default()
                    })
                    .unwrap()
                    .capsule_id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .execute(&id, sh(&format!("echo {} > owner.txt", id)))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().exit_code, 0);
        }
        for id in &ids {
            assert_eq!(registry.changes(id).unwrap().paths(), vec!["owner.txt"]);
        }
        registry.teardown().unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_same_capsule_calls_are_serialized() {
        let ws = workspace();
        fs::write(ws.path().join("c"), "0\n").unwrap();
        let storage = TempDir::new().unwrap();
        let registry = Arc::new(CapsuleRegistry::new(config(storage.path())).unwrap());
        let meta = registry
            .create(CreateOptions {
                workspace: ws.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap();

        // Read-sleep-write: interleaved runs would both read 0
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = meta.capsule_id.clone();
                std::thread::spawn(move || {
                    registry
                        .execute(&id, sh("n=$(cat c); sleep 0.1; echo $((n+1)) > c"))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().exit_code, 0);
        }
        assert_eq!(fs::read_to_string(meta.mount.join("c")).unwrap().trim(), "2");
        registry.teardown().unwrap();
    }
}
