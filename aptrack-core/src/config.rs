//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/aptrack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/aptrack/` (~/.config/aptrack/)
//! - Data: `$XDG_DATA_HOME/aptrack/` (~/.local/share/aptrack/)
//! - State/Logs: `$XDG_STATE_HOME/aptrack/` (~/.local/state/aptrack/)

use crate::error::{Error, Result};
use crate::savefile;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    /// Servers to track when `aptrack track` is run without arguments
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Reconnect policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Transport and handshake timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Progress reconciliation settings
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One tracked game server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Websocket address (`host:port`, `ws://...` or `wss://...`)
    pub address: String,
    /// Room password, if the server requires one
    pub password: Option<String>,
    /// Explicit save file (`*.apsave`)
    pub save_file: Option<PathBuf>,
    /// Explicit multiworld layout file (`*.archipelago`)
    pub multidata_file: Option<PathBuf>,
    /// Directory searched for the newest save / multidata file
    pub output_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Server config for an address with no password or save data.
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Save file to read: explicit path first, then newest in `output_dir`.
    pub fn resolve_save_file(&self) -> Option<PathBuf> {
        self.save_file.clone().or_else(|| {
            self.output_dir
                .as_deref()
                .and_then(|dir| savefile::find_latest(dir, savefile::SAVE_EXTENSION))
        })
    }

    /// Multidata file to read: explicit path first, then newest in `output_dir`.
    pub fn resolve_multidata_file(&self) -> Option<PathBuf> {
        self.multidata_file.clone().or_else(|| {
            self.output_dir
                .as_deref()
                .and_then(|dir| savefile::find_latest(dir, savefile::MULTIDATA_EXTENSION))
        })
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    /// Ceiling for the exponential delay
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Failed attempts tolerated before the session is closed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Consecutive processed messages that mark a session stable
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            stability_threshold: default_stability_threshold(),
        }
    }
}

impl RetryConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_secs == 0 {
            return Err(Error::Config(
                "retry.base_delay_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_secs < self.base_delay_secs {
            return Err(Error::Config(
                "retry.max_delay_secs must be at least retry.base_delay_secs".to_string(),
            ));
        }
        if self.stability_threshold == 0 {
            return Err(Error::Config(
                "retry.stability_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

fn default_stability_threshold() -> u32 {
    5
}

/// Timeouts used by the connection manager and listener
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Websocket connect (TCP + TLS + upgrade)
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Receive timeout before the handshake is confirmed
    #[serde(default = "default_handshake_timeout")]
    pub handshake_secs: u64,

    /// Receive timeout once confirmed; expiry triggers a keepalive probe
    #[serde(default = "default_idle_timeout")]
    pub idle_secs: u64,

    /// Interval between keepalive pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Wait for a pong before declaring the link dead
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            handshake_secs: default_handshake_timeout(),
            idle_secs: default_idle_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

impl TimeoutConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.pong_timeout_secs >= self.ping_interval_secs {
            return Err(Error::Config(
                "timeouts.pong_timeout_secs must be shorter than timeouts.ping_interval_secs"
                    .to_string(),
            ));
        }
        if self.connect_secs == 0 || self.handshake_secs == 0 || self.idle_secs == 0 {
            return Err(Error::Config("timeouts must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_ping_interval() -> u64 {
    20
}

fn default_pong_timeout() -> u64 {
    10
}

/// Progress reconciliation settings
#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    /// Age after which an unattended save file is reported as stale
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    /// Team index consulted in save files (multi-team games are unsupported)
    #[serde(default)]
    pub team: i64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: default_stale_after_hours(),
            team: 0,
        }
    }
}

impl ProgressConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        // chrono caps durations at i64::MAX milliseconds
        const MAX_HOURS: u64 = (i64::MAX / 3_600_000) as u64;
        chrono::Duration::hours(self.stale_after_hours.min(MAX_HOURS) as i64)
    }
}

fn default_stale_after_hours() -> u64 {
    24
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
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
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

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.timeouts.validate()?;
        if self.progress.team != 0 {
            return Err(Error::Config(
                "progress.team must be 0: multi-team games are not supported".to_string(),
            ));
        }
        for server in &self.servers {
            if server.address.trim().is_empty() {
                return Err(Error::Config("servers.address must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Look up a configured server by address
    pub fn server(&self, address: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.address == address)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/aptrack/config.toml` (~/.config/aptrack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("aptrack").join("config.toml")
    }

    /// Returns the data directory path (for persisted local state)
    ///
    /// `$XDG_DATA_HOME/aptrack/` (~/.local/share/aptrack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("aptrack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/aptrack/` (~/.local/state/aptrack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("aptrack")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/aptrack/aptrack.log` (~/.local/state/aptrack/aptrack.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("aptrack.log")
    }

    /// Returns the game status file path
    pub fn game_status_path() -> PathBuf {
        Self::data_dir().join("game_status.json")
    }

    /// Returns the uploaded-file catalog path
    pub fn upload_catalog_path() -> PathBuf {
        Self::data_dir().join("upload_catalog.json")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
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
