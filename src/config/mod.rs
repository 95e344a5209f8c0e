//! Configuration module
//!
//! Handles loading and saving ObsLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{ReconnectConfig, SessionConfig};
use crate::protocol::{EventSubscription, DEFAULT_PORT, RPC_VERSION};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Reconnect settings
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Server connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Websocket URL of the server
    #[serde(default = "default_url")]
    pub url: String,
    /// Server password, if authentication is enabled
    pub password: Option<String>,
    /// Event subscription bitmask requested in Identify
    #[serde(default = "default_event_subscriptions")]
    pub event_subscriptions: u32,
}

fn default_url() -> String {
    format!("ws://127.0.0.1:{}", DEFAULT_PORT)
}

fn default_event_subscriptions() -> u32 {
    EventSubscription::ALL.bits()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            password: None,
            event_subscriptions: default_event_subscriptions(),
        }
    }
}

/// Reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Redial when the server drops the connection
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backoff bounds
    #[serde(flatten)]
    pub backoff: ReconnectConfig,
}

fn default_true() -> bool {
    true
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            backoff: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("obslink/config.toml")),
            Some(PathBuf::from("./obslink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Session settings derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            event_subscriptions: EventSubscription::from(self.connection.event_subscriptions),
            rpc_version: RPC_VERSION,
            reconnect: self.reconnect.backoff,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        connection: ConnectionConfig {
            url: "ws://192.168.1.20:4455".to_string(),
            password: Some("change-me".to_string()),
            event_subscriptions: (EventSubscription::SCENES | EventSubscription::INPUTS).bits(),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
