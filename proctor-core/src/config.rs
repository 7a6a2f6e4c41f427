//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/proctor-sync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/proctor-sync/` (~/.config/proctor-sync/)
//! - Data: `$XDG_DATA_HOME/proctor-sync/` (~/.local/share/proctor-sync/)
//! - State/Logs: `$XDG_STATE_HOME/proctor-sync/` (~/.local/state/proctor-sync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "proctor-sync";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Backend ingestion and upload-credential endpoints
    #[serde(default)]
    pub backend: BackendConfig,

    /// Sync cycle timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// Connectivity probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Payload codec settings
    #[serde(default)]
    pub codec: CodecConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend API configuration
///
/// The backend accepts log batches and hands out signed upload credentials
/// for direct-to-storage image uploads.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Base URL (e.g., `https://exams.example.com/api`)
    pub base_url: Option<String>,

    /// Bearer token for the student session
    pub api_key: Option<String>,

    /// Path of the batch ingestion endpoint, relative to `base_url`
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,

    /// Path of the signed-upload credential endpoint, relative to `base_url`
    #[serde(default = "default_upload_auth_path")]
    pub upload_auth_path: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            ingest_path: default_ingest_path(),
            upload_auth_path: default_upload_auth_path(),
            timeout_secs: default_timeout(),
        }
    }
}

impl BackendConfig {
    /// Check if the backend is configured well enough to sync
    pub fn is_ready(&self) -> bool {
        self.base_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let Some(base_url) = &self.base_url else {
            return Err(Error::Config("backend.base_url is required".to_string()));
        };
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "backend.base_url must be an http(s) URL, got {}",
                base_url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "backend.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_ingest_path() -> String {
    "proctoring/logs/batch".to_string()
}

fn default_upload_auth_path() -> String {
    "proctoring/uploads/auth".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Timing of the sync triggers
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between periodic sync cycles while online and the exam is active
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Seconds between lightweight pending-count refreshes
    #[serde(default = "default_pending_refresh")]
    pub pending_refresh_secs: u64,

    /// Milliseconds to wait after coming back online before syncing
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            pending_refresh_secs: default_pending_refresh(),
            settle_delay_ms: default_settle_delay(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn pending_refresh(&self) -> Duration {
        Duration::from_secs(self.pending_refresh_secs.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_sync_interval() -> u64 {
    30
}

fn default_pending_refresh() -> u64 {
    5
}

fn default_settle_delay() -> u64 {
    2000
}

/// Active connectivity probing
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// Probe the network and pause syncing while it is unreachable
    #[serde(default = "default_probe_enabled")]
    pub enabled: bool,

    /// Health endpoint to probe; defaults to `backend.base_url`
    pub probe_url: Option<String>,

    /// Seconds between probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: default_probe_enabled(),
            probe_url: None,
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn default_probe_enabled() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    10
}

/// Payload codec configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CodecConfig {
    /// Deploy-time secret mixed into every per-submission key
    #[serde(default = "default_codec_secret")]
    pub secret: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            secret: default_codec_secret(),
        }
    }
}

/// Build-time secret, overridable through `PROCTOR_QUEUE_SECRET` at compile time.
fn default_codec_secret() -> String {
    option_env!("PROCTOR_QUEUE_SECRET")
        .unwrap_or("proctor-sync-local-queue")
        .to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also print warnings and errors to stderr
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/proctor-sync/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (for the SQLite queue)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the queue database file path
    ///
    /// `$XDG_DATA_HOME/proctor-sync/queue.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Endpoint the connectivity probe should hit, if probing is enabled.
    ///
    /// Falls back to the backend base URL so a configured agent notices
    /// outages without extra settings.
    pub fn probe_url(&self) -> Option<&str> {
        if !self.connectivity.enabled {
            return None;
        }
        self.connectivity
            .probe_url
            .as_deref()
            .or(self.backend.base_url.as_deref())
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// Binaries call this before anything else reads these variables.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
