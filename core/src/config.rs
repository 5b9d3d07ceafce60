use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Backoff applied to transient replication failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First wait in milliseconds (default: 32)
    pub initial_ms: u64,
    /// Upper bound in milliseconds (default: 1024)
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 32,
            max_ms: 1024,
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.initial_ms))
    }
}

/// In-process store and replication log settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Record budget of the in-memory store (None = unbounded)
    #[serde(default)]
    pub max_records: Option<usize>,
    /// Persist the replication log to this file (None = memory only)
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Secondaries lock and notify while applying replicated operations
    pub concurrent_reads: bool,
    /// Timeout used when a caller does not supply one
    pub default_timeout_ms: u64,
    /// Progress vector length before the oldest entries are dropped
    pub max_progress_entries: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "tandem".to_string(),
            concurrent_reads: true,
            default_timeout_ms: 4000, // 4 seconds
            max_progress_entries: 128,
            backoff: BackoffConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if the file is not found. TANDEM_CONFIG overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        ConfigLoader::new().load(path)
    }
}

/// Resolves configuration from file, CLI args, and environment variables.
struct ConfigLoader {
    args: Vec<String>,
}

impl ConfigLoader {
    fn new() -> Self {
        Self {
            args: env::args().collect(),
        }
    }

    fn load<P: AsRef<Path>>(&self, default_path: P) -> anyhow::Result<ProviderConfig> {
        let mut cfg_path = self.resolve_config_path(default_path);

        if let Ok(env_path) = env::var("TANDEM_CONFIG") {
            cfg_path = PathBuf::from(env_path);
        }

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => toml::from_str::<ProviderConfig>(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProviderConfig::default(),
            Err(e) => return Err(e.into()),
        };
        Self::apply_env_overrides(&mut cfg);
        tracing::debug!(path = %cfg_path.display(), name = %cfg.name, "configuration loaded");
        Ok(cfg)
    }

    fn resolve_config_path<P: AsRef<Path>>(&self, default_path: P) -> PathBuf {
        Self::find_config_arg(&self.args).unwrap_or_else(|| default_path.as_ref().to_path_buf())
    }

    /// Find --config or -c flag in arguments.
    fn find_config_arg(args: &[String]) -> Option<PathBuf> {
        let mut iter = args.iter().peekable();
        while let Some(a) = iter.next() {
            if a.starts_with("--config=") || a.starts_with("-c=") {
                if let Some((_, val)) = a.split_once('=') {
                    return Some(PathBuf::from(val));
                }
            } else if a == "--config" || a == "-c" {
                if let Some(next) = iter.peek() {
                    return Some(PathBuf::from((*next).clone()));
                }
            }
        }
        None
    }

    /// Apply TANDEM_* environment variable overrides.
    fn apply_env_overrides(cfg: &mut ProviderConfig) {
        if let Ok(v) = env::var("TANDEM_NAME") {
            cfg.name = v;
        }

        if let Ok(v) = env::var("TANDEM_CONCURRENT_READS") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.concurrent_reads = b;
            }
        }

        if let Ok(v) = env::var("TANDEM_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.default_timeout_ms = ms;
            }
        }
    }
}
