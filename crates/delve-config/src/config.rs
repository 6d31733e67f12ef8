//! Client settings persisted as RON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_NAME: &str = "delve";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection, timeout and framing settings.
    pub network: NetworkConfig,
    /// Identity sent with the handshake.
    pub session: SessionConfig,
    pub debug: DebugConfig,
}

/// Where the server is and how long to wait on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Game server host name or address.
    pub server_address: String,
    /// Game server port.
    pub server_port: u16,
    /// Upgrade the connection with TLS before any frame traffic.
    pub tls: bool,
    /// Name checked against the server certificate. Falls back to
    /// `server_address` when unset.
    pub tls_server_name: Option<String>,
    /// Upper bound on the TCP connect (and TLS upgrade), in milliseconds.
    pub connect_timeout_ms: u64,
    /// Upper bound on the handshake response wait, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single frame write, in milliseconds.
    pub send_timeout_ms: u64,
    /// Keep-alive cadence while authenticated, in milliseconds. Zero disables it.
    pub heartbeat_interval_ms: u64,
    /// Largest frame body accepted or sent.
    pub max_frame_bytes: u32,
    /// Connection attempts made by the client before giving up.
    pub reconnect_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub reconnect_initial_delay_ms: u64,
    /// Cap on the retry delay, in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

/// Identity sent with every handshake.
///
/// The bearer token is deliberately absent: it is supplied per run and never
/// written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Stable device identifier.
    pub device_id: String,
    /// Version string reported to the server.
    pub client_version: String,
}

/// Diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            tls: false,
            tls_server_name: None,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            max_frame_bytes: 10 * 1024 * 1024,
            reconnect_attempts: 5,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Persistence ---

const CONFIG_FILE: &str = "config.ron";

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    ron::from_str(&text).map_err(ConfigError::Parse)
}

impl Config {
    /// Platform configuration directory for delve (`<config dir>/delve`).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|base| base.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Read `config.ron` from `config_dir`, writing the defaults there
    /// first if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        match read_file(&path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(ConfigError::Read(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(config_dir)?;
                log::info!("Wrote default config to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::Write)?;
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::new().depth_limit(2))
            .map_err(ConfigError::Serialize)?;
        std::fs::write(config_dir.join(CONFIG_FILE), text).map_err(ConfigError::Write)
    }

    /// Re-read the file. `None` when it matches `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_file(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config changed on disk");
        Ok(Some(fresh))
    }
}
