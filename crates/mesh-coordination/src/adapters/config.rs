//! # Config File Loading (requires "config-file" feature)
//!
//! ```toml
//! node_id = "edge-gw-1"
//! node_type = "worker"
//! roles = ["detector", "protector"]
//! associated_devices = ["camera-1", "thermostat"]
//!
//! [network]
//! host = "0.0.0.0"
//! port = 5555
//! coordinator = "10.0.0.1:5555"
//!
//! [timing]
//! heartbeat_interval_ms = 5000
//!
//! [protection_policies.ddos]
//! threshold = 100
//! ```
//!
//! Every key is optional; missing ones take [`NodeConfig::default`] values.

use std::fs;
use std::path::Path;

use crate::domain::{ConfigError, NodeConfig};

/// Loads `NodeConfig` from TOML.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlConfigLoader;

impl TomlConfigLoader {
    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file without validating it, for callers
    /// that layer overrides on top before building a node.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<NodeConfig, ConfigError> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
