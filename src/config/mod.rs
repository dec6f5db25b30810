//! Configuration module
//!
//! Handles loading and saving the screen configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{self, PeerContext};
use crate::protocol::DEFAULT_PORT;
use crate::scene::SceneConfig;

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

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Headless scene settings
    #[serde(default)]
    pub scene: SceneConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this screen
    pub name: String,
    /// Stable identifier that fixes our color (random per run if not set)
    pub identity: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            identity: None,
            verbose: false,
        }
    }
}

/// How peers find each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryBackend {
    #[default]
    Mdns,
    Disabled,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Port to listen on (0 picks a free one)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Invite handshake timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-candidate invitation timeout in ms
    #[serde(default = "default_invite_timeout")]
    pub invite_timeout_ms: u64,
    /// Per-triangle send timeout in ms
    #[serde(default = "default_give_timeout")]
    pub give_timeout_ms: u64,
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Outgoing queue size per neighbor
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause between scans in ms
    #[serde(default = "default_search_retry")]
    pub search_retry_ms: u64,
    /// Look for a right neighbor
    #[serde(default = "default_true")]
    pub seek_neighbors: bool,
    /// Discovery backend
    #[serde(default)]
    pub discovery: DiscoveryBackend,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_invite_timeout() -> u64 {
    30_000
}

fn default_give_timeout() -> u64 {
    100
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_search_retry() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            invite_timeout_ms: default_invite_timeout(),
            give_timeout_ms: default_give_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            queue_capacity: default_queue_capacity(),
            search_retry_ms: default_search_retry(),
            seek_neighbors: default_true(),
            discovery: DiscoveryBackend::default(),
        }
    }
}

impl NetworkSettings {
    /// Runtime settings for the network core
    pub fn to_network_config(&self) -> ConfigResult<network::NetworkConfig> {
        let defaults = network::NetworkConfig::default();
        let bind_address = match &self.bind_address {
            Some(addr) => addr
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidAddress(addr.clone()))?,
            None => defaults.bind_address,
        };

        Ok(network::NetworkConfig {
            bind_address,
            port: self.port,
            connect_timeout_ms: self.connect_timeout_ms,
            invite_timeout_ms: self.invite_timeout_ms,
            give_timeout_ms: self.give_timeout_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            queue_capacity: self.queue_capacity,
            search_retry_ms: self.search_retry_ms,
            seek_neighbors: self.seek_neighbors,
        })
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
            dirs::config_dir().map(|p| p.join("triangles/config.toml")),
            Some(PathBuf::from("./triangles.toml")),
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

    /// Identity for this run
    pub fn peer_context(&self) -> PeerContext {
        let identity = self
            .general
            .identity
            .as_ref()
            .map(|id| id.as_bytes().to_vec());
        PeerContext::new(self.general.name.clone(), identity)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Living room".to_string(),
            identity: Some("living-room-tv".to_string()),
            verbose: false,
        },
        scene: SceneConfig {
            auto_accept: true,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
