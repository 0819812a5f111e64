/// Environment hygiene for commands run inside a capsule
///
/// The child starts from an empty environment. Only whitelisted host variables
/// and a minimal safe set pass through; loader injection variables never do.
use std::collections::BTreeMap;
use std::env;

/// Variables passed through from the host even without a whitelist entry
pub const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "TZ", "USER", "LOGNAME", "SHELL",
    "TMPDIR",
];

/// Prefixes of dynamic loader variables stripped unconditionally
pub const LOADER_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Exported when a capsule runs with a nonzero clock offset
pub const CLOCK_OFFSET_VAR: &str = "CAPSULE_CLOCK_OFFSET";

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Environment builder for one capsule
#[derive(Debug, Clone, Default)]
pub struct EnvHygiene {
    whitelist: Vec<String>,
    clock_offset_sec: i64,
}

impl EnvHygiene {
    pub fn new(whitelist: Vec<String>, clock_offset_sec: i64) -> Self {
        EnvHygiene {
            whitelist,
            clock_offset_sec,
        }
    }

    /// Build the child environment from the current process environment
    pub fn build_environment(&self) -> BTreeMap<String, String> {
        self.build_from(env::vars())
    }

    /// Build the child environment from an explicit host environment
    pub fn build_from<I>(&self, host: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env_map = BTreeMap::new();

        for (key, value) in host {
            if is_loader_var(&key) {
                if self.whitelist.iter().any(|w| w == &key) {
                    log::warn!("Refusing to pass loader variable {} into capsule", key);
                }
                continue;
            }
            let allowed =
                SAFE_ENV_VARS.contains(&key.as_str()) || self.whitelist.iter().any(|w| w == &key);
            if allowed {
                env_map.insert(key, value);
            }
        }

        env_map
            .entry("PATH".to_string())
            .or_insert_with(|| FALLBACK_PATH.to_string());

        if self.clock_offset_sec != 0 {
            env_map.insert(
                CLOCK_OFFSET_VAR.to_string(),
                self.clock_offset_sec.to_string(),
            );
        }

        env_map
    }
}

fn is_loader_var(key: &str) -> bool {
    LOADER_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/opt/bin:/usr/bin".to_string()),
            ("HOME".to_string(), "/home/dev".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string()),
            ("CI".to_string(), "true".to_string()),
            ("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string()),
        ]
    }

    #[test]
    fn test_strips_unlisted_variables() {
        let env = EnvHygiene::new(Vec::new(), 0).build_from(host());
        assert_eq!(env.get("PATH").unwrap(), "/opt/bin:/usr/bin");
        assert_eq!(env.get("HOME").unwrap(), "/home/dev");
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("CI"));
        assert!(!env.contains_key(CLOCK_OFFSET_VAR));
    }

    #[test]
    fn test_whitelist_passes_through_but_loader_vars_never_do() {
        let hygiene = EnvHygiene::new(vec!["CI".to_string(), "LD_PRELOAD".to_string()], 0);
        let env = hygiene.build_from(host());
        assert_eq!(env.get("CI").unwrap(), "true");
        assert!(!env.contains_key("LD_PRELOAD"));
    }

    #[test]
    fn test_clock_offset_exported_when_nonzero() {
        let env = EnvHygiene::new(Vec::new(), -3600).build_from(host());
        assert_eq!(env.get(CLOCK_OFFSET_VAR).unwrap(), "-3600");
    }

    #[test]
    fn test_fallback_path_when_host_has_none() {
        let env = EnvHygiene::new(Vec::new(), 0).build_from(Vec::new());
        assert_eq!(env.get("PATH").unwrap(), FALLBACK_PATH);
    }
}
