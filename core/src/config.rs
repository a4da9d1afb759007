use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Distinct scan planner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Consider DISTINCT_SCAN at all (default: true)
    pub enable_distinct_scan: bool,
    /// Allow DISTINCT_SCAN plans that need a FETCH per group (default: true)
    pub allow_fetch: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_distinct_scan: true,
            allow_fetch: true,
        }
    }
}

/// Pipeline execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Largest input a blocking sort accepts (default: 100_000 documents)
    pub max_blocking_sort_documents: usize,
    /// Re-plan attempts after a scan is invalidated (default: 3)
    pub max_replans: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_blocking_sort_documents: 100_000,
            max_replans: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if file is not found. KEYSEEK_CONFIG env var overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        ConfigLoader::new().load(path)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Resolves configuration from file and environment variables. The caller
/// supplies the path, typically from its own command line parsing.
struct ConfigLoader;

impl ConfigLoader {
    fn new() -> Self {
        Self
    }

    fn load<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<Config> {
        let cfg_path = env::var("KEYSEEK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => Config::from_toml_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        Self::apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    /// Apply KEYSEEK_* environment variable overrides.
    fn apply_env_overrides(cfg: &mut Config) {
        if let Ok(v) = env::var("KEYSEEK_ENABLE_DISTINCT_SCAN")
            && let Some(b) = parse_bool(&v)
        {
            cfg.planner.enable_distinct_scan = b;
        }

        if let Ok(v) = env::var("KEYSEEK_ALLOW_FETCH")
            && let Some(b) = parse_bool(&v)
        {
            cfg.planner.allow_fetch = b;
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
