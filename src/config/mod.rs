//! Configuration management.
//!
//! flowrun configuration can come from:
//! - Environment variables (FLOWRUN_*)
//! - Config file (~/.config/flowrun/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// flowrun configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Flow run tuning
    #[serde(default)]
    pub run: RunConfig,

    /// Outbound HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection acquisition timeout (seconds)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// SQLite busy timeout (milliseconds)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Payloads larger than this are compressed
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            busy_timeout_ms: default_busy_timeout(),
            compress_threshold_bytes: default_compress_threshold(),
        }
    }
}

fn default_pool_size() -> u32 {
    4
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_busy_timeout() -> u64 {
    1000
}

fn default_compress_threshold() -> usize {
    crate::storage::DEFAULT_COMPRESS_THRESHOLD
}

/// Flow run tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Flow deadline when the `timeout` variable is absent (seconds)
    #[serde(default = "default_run_timeout")]
    pub default_timeout_secs: u64,

    /// How long teardown waits for the scheduler after cancelling it
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Deadline covering all retries of one persistence write
    #[serde(default = "default_persist_deadline")]
    pub persist_deadline_ms: u64,

    /// Status channel capacity
    #[serde(default = "default_buffer")]
    pub status_buffer: usize,

    /// Stream sender channel capacity
    #[serde(default = "default_buffer")]
    pub stream_buffer: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_run_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            persist_deadline_ms: default_persist_deadline(),
            status_buffer: default_buffer(),
            stream_buffer: default_buffer(),
        }
    }
}

impl RunConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn persist_deadline(&self) -> Duration {
        Duration::from_millis(self.persist_deadline_ms)
    }
}

fn default_run_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_persist_deadline() -> u64 {
    2000
}

fn default_buffer() -> usize {
    1024
}

/// Outbound HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Whole-request timeout (seconds)
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let partial: PartialConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("flowrun"))
            .unwrap_or_else(|| PathBuf::from(".flowrun"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("flowrun"))
            .unwrap_or_else(|| PathBuf::from(".flowrun"))
    }

    /// Database path, falling back to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("flowrun.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FLOWRUN_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        override_parsed("FLOWRUN_DB_POOL_SIZE", &mut self.storage.pool_size);
        override_parsed(
            "FLOWRUN_DB_POOL_TIMEOUT_SECS",
            &mut self.storage.connection_timeout_secs,
        );
        override_parsed("FLOWRUN_DB_BUSY_TIMEOUT_MS", &mut self.storage.busy_timeout_ms);
        override_parsed(
            "FLOWRUN_COMPRESS_THRESHOLD_BYTES",
            &mut self.storage.compress_threshold_bytes,
        );
        override_parsed("FLOWRUN_RUN_TIMEOUT_SECS", &mut self.run.default_timeout_secs);
        override_parsed("FLOWRUN_SHUTDOWN_GRACE_MS", &mut self.run.shutdown_grace_ms);
        override_parsed("FLOWRUN_PERSIST_DEADLINE_MS", &mut self.run.persist_deadline_ms);
        override_parsed("FLOWRUN_STATUS_BUFFER", &mut self.run.status_buffer);
        override_parsed("FLOWRUN_STREAM_BUFFER", &mut self.run.stream_buffer);
        override_parsed("FLOWRUN_HTTP_TIMEOUT_SECS", &mut self.http.timeout_secs);
        override_parsed(
            "FLOWRUN_HTTP_CONNECT_TIMEOUT_SECS",
            &mut self.http.connect_timeout_secs,
        );
        if let Ok(level) = std::env::var("FLOWRUN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("FLOWRUN_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(run) = partial.run {
            self.run = run;
        }
        if let Some(http) = partial.http {
            self.http = http;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Some(parsed) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
        *target = parsed;
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    run: Option<RunConfig>,
    http: Option<HttpConfig>,
    logging: Option<LoggingConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.pool_size, 4);
        assert_eq!(config.storage.compress_threshold_bytes, 1024);
        assert_eq!(config.run.default_timeout(), Duration::from_secs(60));
        assert_eq!(config.run.persist_deadline(), Duration::from_secs(2));
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[run]
default_timeout_secs = 5

[logging]
json = true
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.run.default_timeout_secs, 5);
        assert_eq!(config.run.shutdown_grace_ms, 2000);
        assert!(config.logging.json);
        assert_eq!(config.storage.pool_size, 4);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[run\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
