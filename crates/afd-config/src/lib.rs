//! # afd-config
//!
//! Configuration management for the AFD core.
//!
//! Loads configuration from:
//! 1. Built-in defaults
//! 2. `$AFD_WORK_DIR/etc/AFD_CONFIG` (TOML, every key optional)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub use path::WorkDir;

/// Default seconds a caller waits for a reply on a response FIFO
pub const DEFAULT_RESPONSE_TIME: u64 = 10;

/// Upper bound of unique numbers handed out within one second
pub const MAX_MSG_PER_SEC: u32 = 9999;

/// Files of unknown type must be at least this old before they are touched
pub const DEFAULT_TRANSFER_TIMEOUT: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub afd: AfdConfig,
    pub amg: AmgConfig,
    pub fd: FdConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config for the given work directory
    pub fn load(work_dir: &WorkDir) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&work_dir.afd_config())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a single AFD_CONFIG file. A missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        debug!("Loading AFD_CONFIG from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(secs) = std::env::var("AFD_RESPONSE_TIME") {
            if let Ok(n) = secs.parse() {
                self.afd.default_response_time = n;
            }
        }
        if let Ok(level) = std::env::var("AFD_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Process-group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AfdConfig {
    /// Seconds to wait on afd.resp before declaring AFD unresponsive
    pub default_response_time: u64,
    /// Global ceiling of concurrently running transport workers
    pub max_connections: usize,
    /// Scan directories at start (START_AFD vs START_AFD_NO_DIR_SCAN)
    pub dir_scan_enabled: bool,
}

impl Default for AfdConfig {
    fn default() -> Self {
        Self {
            default_response_time: DEFAULT_RESPONSE_TIME,
            max_connections: 50,
            dir_scan_enabled: true,
        }
    }
}

/// Directory ingest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmgConfig {
    /// Default per-directory rescan interval in seconds
    pub rescan_time: u64,
    /// Seconds between unknown-file sweeps when inotify drives the scan
    pub unknown_file_tick: u64,
    /// Maximum files moved from one directory in one scan
    pub max_copied_files: u32,
    /// Maximum bytes moved from one directory in one scan
    pub max_copied_file_size: u64,
    /// Queued files above which a directory is held back (0 = no limit)
    pub max_queued_files: u32,
    /// Queued bytes above which a directory is held back (0 = no limit)
    pub max_queued_size: u64,
    /// Subdirectories per parent before the link-count limit is hit
    pub max_link_count: u32,
    /// Global transfer timeout guarding unknown-file deletion
    pub default_transfer_timeout: u64,
    /// Seconds a paused-directory delete may run before yielding
    pub paused_delete_timeout: u64,
    /// Use inotify on top of the periodic scan
    pub inotify: bool,
}

impl Default for AmgConfig {
    fn default() -> Self {
        Self {
            rescan_time: 5,
            unknown_file_tick: 60,
            max_copied_files: 100,
            max_copied_file_size: 100 * 1024 * 1024,
            max_queued_files: 0,
            max_queued_size: 0,
            max_link_count: 32000,
            default_transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            paused_delete_timeout: 30,
            inotify: true,
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FdConfig {
    /// Dispatcher tick in milliseconds
    pub tick_ms: u64,
    /// Retry backoff grows linearly up to this many retry intervals
    pub max_retry_backoff_factor: u32,
    /// Hand queued messages to an open session instead of respawning
    pub burst_enabled: bool,
    /// Age limit in seconds applied when a job has none (0 = unlimited)
    pub default_age_limit: u32,
    /// Allow one probing transfer for hosts in the error queue
    pub error_queue_probe: bool,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            max_retry_backoff_factor: 10,
            burst_enabled: true,
            default_age_limit: 0,
            error_queue_probe: true,
        }
    }
}

/// Transport worker programs, keyed by URL scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub workers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let mut workers = BTreeMap::new();
        for scheme in ["ftp", "sftp", "http", "https", "smtp", "mailto", "file", "scp"] {
            workers.insert(scheme.to_string(), format!("sf_{}", scheme));
        }
        Self { workers }
    }
}

/// Diagnostics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when neither AFD_LOG nor RUST_LOG is set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.afd.default_response_time, DEFAULT_RESPONSE_TIME);
        assert!(config.fd.burst_enabled);
        assert_eq!(config.amg.paused_delete_timeout, 30);
        assert_eq!(config.transport.workers["ftp"], "sf_ftp");
    }

    #[test]
    fn test_default_toml_parses_back() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[amg]"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.amg.max_link_count, 32000);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load_file(Path::new("/nonexistent/AFD_CONFIG")).unwrap();
        assert_eq!(config.fd.tick_ms, 1000);
    }
}
