//! Configuration management for lancoop.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/lancoop/config.toml`
//! - macOS: `~/Library/Application Support/lancoop/config.toml`
//!
//! On first run, no config file exists. The daemon detects this and
//! creates one with a fresh `device_uuid` and a hostname-derived name.
//!
//! # Config File Format (TOML)
//!
//! ```toml
//! device_uuid = "550e8400-e29b-41d4-a716-446655440000"
//! device_name = "Workroom PC"
//! tcp_port = 0                 # 0 means auto-assign
//! discovery_port = 51595
//! shared_clipboard_on = false
//! shared_devices_on = false
//! accept_device_sharing = true
//! # storage_dir = "/home/me/Downloads"   # where received files land
//! # confirm_command = "lancoop-confirm"
//! # injector_command = "lancoop-inject"
//! ```

use crate::types::{Compositor, DeviceInfo, DeviceOs, PeerUuid, DEFAULT_DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}

/// External helper spawned to confirm an inbound pair request. It writes
/// one status byte to stdout and exits.
pub const DEFAULT_CONFIRM_COMMAND: &str = "lancoop-confirm";

/// External helper that injects input events read as binary triples from
/// its stdin.
pub const DEFAULT_INJECTOR_COMMAND: &str = "lancoop-inject";

/// The persisted configuration for this lancoop instance.
///
/// This is what gets saved to and loaded from the TOML config file.
/// All fields have sensible defaults except `device_uuid`, which must be
/// generated on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Unique identifier for this machine (UUID v4, generated once).
    pub device_uuid: String,

    /// Human-readable name for this machine (shown on peers' pair dialogs).
    pub device_name: String,

    /// TCP port for the peer session listener.
    /// `0` means the OS assigns a random available port.
    #[serde(default)]
    pub tcp_port: u16,

    /// UDP port for discovery beacons.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Whether this device offers its clipboard to paired peers.
    #[serde(default)]
    pub shared_clipboard_on: bool,

    /// Whether this device offers its input devices to paired peers.
    #[serde(default)]
    pub shared_devices_on: bool,

    /// Whether inbound device-sharing requests are accepted.
    #[serde(default = "default_true")]
    pub accept_device_sharing: bool,

    /// Where received files are written. Defaults to the platform download
    /// directory, falling back to the data directory.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Command spawned to confirm an inbound pair request.
    #[serde(default)]
    pub confirm_command: Option<String>,

    /// Command spawned to inject forwarded input events.
    #[serde(default)]
    pub injector_command: Option<String>,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Returns the platform-appropriate config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("lancoop"))
    }

    /// Returns the full path to the config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Returns the platform-appropriate data directory (logs, mountpoint).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("lancoop"))
    }

    /// Filesystem path at which a paired peer's export is mounted.
    pub fn mountpoint() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir().ok_or(ConfigError::NoConfigDir)?.join("mp"))
    }

    /// Resolved receive directory for incoming files.
    pub fn resolved_storage_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage_dir {
            return dir.clone();
        }
        dirs::download_dir()
            .or_else(Self::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Command used for the pair-confirmation dialog.
    pub fn confirm_command(&self) -> &str {
        self.confirm_command
            .as_deref()
            .unwrap_or(DEFAULT_CONFIRM_COMMAND)
    }

    /// Command used for the input injector.
    pub fn injector_command(&self) -> &str {
        self.injector_command
            .as_deref()
            .unwrap_or(DEFAULT_INJECTOR_COMMAND)
    }

    /// The identity record this daemon presents in beacons and handshakes.
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            uuid: PeerUuid::new(&self.device_uuid),
            name: self.device_name.clone(),
            os: DeviceOs::current(),
            compositor: Compositor::detect(),
        }
    }

    /// Loads the config from the default config file path.
    ///
    /// Returns `Ok(None)` if the config file doesn't exist yet (first run).
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    /// Loads the config from a specific file path.
    ///
    /// Returns `Ok(None)` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }

    /// Saves this config to the default config file path.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    /// Saves this config to a specific file path.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: path.to_owned(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    /// Creates a new config for first-run with a fresh device uuid.
    pub fn new_first_run(device_name: &str) -> Self {
        Self {
            device_uuid: PeerUuid::generate().to_string(),
            device_name: device_name.to_string(),
            tcp_port: 0,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            shared_clipboard_on: false,
            shared_devices_on: false,
            accept_device_sharing: true,
            storage_dir: None,
            confirm_command: None,
            injector_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
