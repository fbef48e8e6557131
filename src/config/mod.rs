use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for the vesseld server.
///
/// Loaded from "config.json" in the working directory; a default file is
/// written on first boot so operators always have something to edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The port number on which the server will listen
    pub port: u16,

    /// The IP address to which the server will bind
    pub address: String,

    /// Name under which this node registers in the cluster
    pub node_name: String,

    /// Daemon data root (catalog, storage pools, legacy trees)
    pub data_dir: String,

    /// List of other server instances in the cluster
    pub instances: Vec<Instance>,
}

/// A peer server in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub port: u16,
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            address: "127.0.0.1".to_string(),
            node_name: "vessel-01".to_string(),
            data_dir: "/var/lib/vessel".to_string(),
            instances: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    FileNotFound,
    FailedToWrite,
    ParseError,
}

lazy_static! {
    pub static ref SERVER_CONFIG: Arc<ServerConfig> =
        Arc::new(ServerConfig::read().expect("Failed to initialize server config"));
}

impl ServerConfig {
    /// Reads the configuration, writing defaults when no file exists yet.
    pub fn read() -> Result<Self, ConfigError> {
        let config_path = "config.json";
        let config_content = match std::fs::read_to_string(config_path) {
            Ok(content) => content,
            Err(_) => {
                Self::write_default().expect("Failed to write default config");
                return Ok(ServerConfig::default());
            }
        };

        match serde_json::from_str(&config_content) {
            Ok(config) => Ok(config),
            Err(_) => Err(ConfigError::ParseError),
        }
    }

    pub fn write(&self) -> Result<(), ConfigError> {
        let config_content = match serde_json::to_string_pretty(&self) {
            Ok(content) => content,
            Err(_) => return Err(ConfigError::ParseError),
        };

        match std::fs::write("config.json", config_content) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::FailedToWrite),
        }
    }

    pub fn write_default() -> Result<(), ConfigError> {
        ServerConfig::default().write()
    }
}
