//! # strata-config
//!
//! Configuration management for the strata snapshot store.
//!
//! The configuration document is JSON. Resolution order:
//! 1. Built-in defaults
//! 2. Config file (path from the `CONFIG` environment variable)
//! 3. Environment variable overrides (`ROOT`)

pub mod logging;
pub mod watcher;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fixed chunk size. Any other configured value is rejected.
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Hard cap on the fetch queue capacity.
pub const MAX_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage root path (required, non-empty)
    pub root: PathBuf,
    /// Enable the read-only image + union mount path
    pub enable_erofs: bool,
    /// Enable the kernel cache + prefetch path
    pub enable_fscache: bool,
    /// Enable the simple (non-cache-backed) lazy fetch fallback
    pub enable_lazy: bool,
    /// Enable the page deduplicator
    pub enable_mem_dedup: bool,
    /// Base URL for byte-range chunk fetches
    pub registry: String,
    /// Chunk size in bytes; must equal 4 MiB
    pub chunk_size: u64,
    /// `debug` | `info` | `warn` | `error`
    pub log_level: String,
    pub prefetch: PrefetchConfig,
    pub ksm: KsmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            enable_erofs: true,
            enable_fscache: true,
            enable_lazy: true,
            enable_mem_dedup: true,
            registry: String::new(),
            chunk_size: CHUNK_SIZE,
            log_level: "info".to_string(),
            prefetch: PrefetchConfig::default(),
            ksm: KsmConfig::default(),
        }
    }
}

/// Fetch/prefetch engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Fetch worker count
    pub workers: usize,
    /// Fetch queue capacity (hard cap 10000)
    pub queue_size: usize,
    /// Trace file root; defaults to `<root>/traces`
    pub trace_dir: PathBuf,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            queue_size: 1000,
            trace_dir: PathBuf::new(),
        }
    }
}

/// Kernel same-page merging tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KsmConfig {
    pub enabled: bool,
    /// Scan sleep interval in milliseconds
    pub scan_interval: u64,
    /// Pages scanned per wakeup
    pub pages_to_scan: u64,
    pub merge_across_nodes: bool,
}

impl Default for KsmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval: 100,
            pages_to_scan: 100,
            merge_across_nodes: false,
        }
    }
}

impl Config {
    /// Default configuration rooted at the given storage path.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let mut config = Config {
            root: root.clone(),
            ..Config::default()
        };
        config.prefetch.trace_dir = root.join("traces");
        config
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut config: Config = serde_json::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (highest priority).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("ROOT") {
            if !root.is_empty() {
                self.root = PathBuf::from(root);
            }
        }
    }

    /// Validate the document. Zero-valued worker and queue tunables are
    /// normalized to their defaults; everything else invalid is rejected.
    pub fn validate(&mut self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root path is required".to_string()));
        }
        if self.chunk_size != CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be {} bytes, got {}",
                CHUNK_SIZE, self.chunk_size
            )));
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown log_level {:?}",
                    other
                )));
            }
        }
        if self.prefetch.workers == 0 {
            self.prefetch.workers = 4;
        }
        if self.prefetch.queue_size == 0 {
            self.prefetch.queue_size = 1000;
        }
        if self.prefetch.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "prefetch.queue_size exceeds hard cap {}",
                MAX_QUEUE_SIZE
            )));
        }
        if self.prefetch.trace_dir.as_os_str().is_empty() {
            self.prefetch.trace_dir = self.root.join("traces");
        }
        Ok(())
    }

    /// Persist the document, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
