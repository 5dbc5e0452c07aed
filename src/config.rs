//! Configuration loading and persistence.
//!
//! Handles reading and writing the sail-relay configuration file. Values
//! not present in the file fall back to working defaults, and a few knobs
//! can be overridden via `SAIL_RELAY_*` environment variables (useful for
//! tests and CI).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the relay daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Name of the native messaging host to connect to.
    pub host_name: String,
    /// Relay socket path. `None` uses the per-user runtime directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Directories searched for the host manifest. `None` uses the
    /// platform defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_dirs: Option<Vec<PathBuf>>,
    /// Seconds to wait for the host handshake.
    pub connect_timeout: u64,
    /// Seconds to wait for a host response.
    pub request_timeout: u64,
    /// Seconds to wait for a tunnel transport to open.
    pub tunnel_open_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_name: constants::HOST_NAME.to_string(),
            socket_path: None,
            manifest_dirs: None,
            connect_timeout: constants::CONNECT_TIMEOUT.as_secs(),
            request_timeout: constants::REQUEST_TIMEOUT.as_secs(),
            tunnel_open_timeout: constants::TUNNEL_OPEN_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SAIL_RELAY_CONFIG_DIR` overrides the platform config directory
    /// (integration tests point this at a tempdir).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SAIL_RELAY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("sail-relay")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host_name) = std::env::var("SAIL_RELAY_HOST_NAME") {
            self.host_name = host_name;
        }
        if let Ok(socket_path) = std::env::var("SAIL_RELAY_SOCKET") {
            self.socket_path = Some(PathBuf::from(socket_path));
        }
        if let Ok(timeout) = std::env::var("SAIL_RELAY_CONNECT_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.connect_timeout = secs;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// The relay socket path, defaulting to the per-user runtime directory.
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sail-relay")
            .join("relay.sock")
    }

    /// Path of the persisted approved-hosts list.
    pub fn approved_hosts_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("approved_hosts.json"))
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Tunnel open timeout as a `Duration`.
    pub fn tunnel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_open_timeout)
    }
}
