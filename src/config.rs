use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default wall-clock budget for one script evaluation.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an interrupted script gets to actually stop.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// User agent sent by extension downloads that do not set their own.
pub const DEFAULT_EXTENSION_USER_AGENT: &str = "Acquire-Extension/1.0";

/// Backend configuration. Every field has a default, so a partial JSON file
/// (or none at all) is valid.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Root under which each extension gets its private data directory
    pub extensions_data_dir: PathBuf,
    /// When set, the backend logger writes here
    pub log_dir: Option<PathBuf>,

    pub script_timeout_ms: u64,
    pub script_grace_ms: u64,
    pub script_memory_limit_mb: usize,

    pub request_timeout_secs: u64,
    pub extension_user_agent: String,

    pub track_cache_ttl_secs: u64,
    pub track_cache_sweep_secs: u64,
    pub index_ttl_secs: u64,
    pub prewarm_concurrency: usize,

    /// Download directories registered before any script runs
    pub allowed_download_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("acquire");
        Self {
            extensions_data_dir: base.join("extensions"),
            log_dir: None,
            script_timeout_ms: DEFAULT_SCRIPT_TIMEOUT.as_millis() as u64,
            script_grace_ms: INTERRUPT_GRACE.as_millis() as u64,
            script_memory_limit_mb: 64,
            request_timeout_secs: 60,
            extension_user_agent: DEFAULT_EXTENSION_USER_AGENT.to_string(),
            track_cache_ttl_secs: 30 * 60,
            track_cache_sweep_secs: 5 * 60,
            index_ttl_secs: 5 * 60,
            prewarm_concurrency: 3,
            allowed_download_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply `ACQUIRE_*` environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.with_env_overrides()
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("ACQUIRE_EXTENSIONS_DATA_DIR") {
            self.extensions_data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACQUIRE_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ACQUIRE_SCRIPT_TIMEOUT_MS") {
            self.script_timeout_ms = parse_number("ACQUIRE_SCRIPT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("ACQUIRE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_number("ACQUIRE_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ACQUIRE_PREWARM_CONCURRENCY") {
            self.prewarm_concurrency = parse_number("ACQUIRE_PREWARM_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("ACQUIRE_ALLOWED_DOWNLOAD_DIRS") {
            self.allowed_download_dirs = std::env::split_paths(&v).collect();
        }
        Ok(())
    }

    /// Ensure the data root and log directory exist
    pub fn ensure_directories_exist(&self) -> Result<()> {
        let mut dirs_to_create = vec![&self.extensions_data_dir];
        if let Some(log_dir) = &self.log_dir {
            dirs_to_create.push(log_dir);
        }

        for dir in dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    Error::Config(format!("Failed to create directory {}: {}", dir.display(), e))
                })?;
            }
        }

        Ok(())
    }

    /// Start the file logger when a log directory is configured
    pub fn init_logging(&self) -> Result<()> {
        if let Some(log_dir) = &self.log_dir {
            crate::logging::BackendLogger::init(
                log_dir.join("backend_logs.txt"),
                log_dir.join("backend_errors.txt"),
            )
            .map_err(Error::Config)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn script_grace(&self) -> Duration {
        Duration::from_millis(self.script_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn track_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.track_cache_ttl_secs)
    }

    pub fn track_cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.track_cache_sweep_secs)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", key, raw)))
}
