//! Configuration management for the Cinder daemon.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::AppError;
use crate::network_type::NetworkType;

/// Get the platform-specific data directory for Cinder
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\cinder
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cinder")
    } else {
        // Linux/Mac: ~/.cinder
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cinder")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_network() -> String {
    "testnet".to_string()
}

impl NodeConfig {
    pub fn network_type(&self) -> NetworkType {
        match self.network.to_lowercase().as_str() {
            "mainnet" => NetworkType::Mainnet,
            _ => NetworkType::Testnet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub max_peers: u32,
    pub bootstrap_peers: Vec<String>,
}

impl NetworkConfig {
    pub fn full_listen_address(&self, network_type: &NetworkType) -> String {
        if self.listen_address.contains(':') {
            self.listen_address.clone()
        } else {
            format!(
                "{}:{}",
                self.listen_address,
                network_type.default_p2p_port()
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "cinder-node".to_string(),
                network: default_network(),
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0".to_string(),
                max_peers: 32,
                bootstrap_peers: Vec::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path, e)))?;
        toml::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Failed to parse {}: {}", path, e)))
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize: {}", e)))?;
        if let Some(parent) = PathBuf::from(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    AppError::Config(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        fs::write(path, contents)
            .map_err(|e| AppError::Config(format!("Failed to write {}: {}", path, e)))
    }

    /// Load the config, writing the defaults first when the file is missing
    pub fn load_or_create(path: &str) -> Result<Self, AppError> {
        if PathBuf::from(path).exists() {
            Self::load_from_file(path)
        } else {
            let config = Self::default();
            config.save_to_file(path)?;
            Ok(config)
        }
    }
}
