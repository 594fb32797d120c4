use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default SDO timeout used when neither the node nor the call overrides it
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Compatibility switches for peers that do not follow CiA 301 to the letter.
/// Configured once per node, they persist across transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quirks {
    /// Pad every outbound frame to 8 bytes, for peers that reject short frames
    pub force_full_frame_length: bool,
    /// Do not check that initiate responses echo our index/subindex
    pub ignore_multiplexer: bool,
}

/// Per-engine settings fixed at construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub quirks: Quirks,
    /// Largest payload the engine will buffer; `None` means unbounded
    pub max_transfer_size: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Could not determine config file path")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u8,
    #[serde(default)]
    pub quirks: Quirks,
    /// Overrides the connection-wide timeout for this node
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub can_interface: String,
    pub default_timeout_ms: u64,
    pub max_transfer_size: Option<usize>,
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            can_interface: "can0".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_transfer_size: None,
            nodes: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Get the path to the config file
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "canopen-sdo")
            .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location, returns default if the
    /// file doesn't exist or can't be parsed
    pub fn load() -> Self {
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                match Self::load_from(&config_path) {
                    Ok(config) => {
                        info!("Loaded configuration from {:?}", config_path);
                        return config;
                    }
                    Err(e) => warn!("{}", e),
                }
            }
        }

        info!("Using default configuration");
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_file_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn node(&self, node_id: u8) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }

    /// Engine settings for `node_id`, falling back to no quirks
    pub fn engine_config(&self, node_id: u8) -> EngineConfig {
        EngineConfig {
            quirks: self.node(node_id).map(|node| node.quirks).unwrap_or_default(),
            max_transfer_size: self.max_transfer_size,
        }
    }

    /// Timeout for `node_id`, honouring a per-node override
    pub fn timeout_for(&self, node_id: u8) -> Duration {
        self.node(node_id)
            .and_then(|node| node.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.default_timeout())
    }
}
