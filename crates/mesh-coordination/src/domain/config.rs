//! # Node Configuration
//!
//! Every field has a default so partial config files and partial
//! `update_config` command payloads deserialize cleanly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::domain::errors::ConfigError;
use crate::domain::policy::{deep_merge, PolicySet};
use crate::domain::value_objects::{NodeId, NodeType, Role, RoleSet};

/// Complete configuration of one security node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Generated when absent.
    pub node_id: Option<NodeId>,
    pub node_type: NodeType,
    pub roles: RoleSet,
    /// Devices guarded by this node (reported in snapshots).
    pub associated_devices: Vec<String>,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    /// Initial local policy state.
    pub protection_policies: PolicySet,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_type: NodeType::Worker,
            roles: RoleSet::from([Role::Detector, Role::Protector]),
            associated_devices: Vec::new(),
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            protection_policies: PolicySet::new(),
        }
    }
}

impl NodeConfig {
    pub fn coordinator() -> Self {
        Self {
            node_type: NodeType::Coordinator,
            ..Self::default()
        }
    }

    pub fn worker(coordinator: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.network.coordinator = Some(coordinator.into());
        config
    }

    #[must_use]
    pub fn with_node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = roles;
        self
    }

    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Check the values the loops depend on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;
        if self.node_type == NodeType::Worker && self.network.coordinator.is_none() {
            return Err(ConfigError::Invalid {
                field: "network.coordinator",
                reason: "required for worker nodes".into(),
            });
        }
        Ok(())
    }

    /// Apply an `update_config` payload: deep-merge `changes` into the
    /// serialized form, then re-parse and validate.
    ///
    /// `node_id` and `node_type` are fixed for the process lifetime.
    pub fn merged_with(&self, changes: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut current = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(ConfigError::Parse("config is not an object".into())),
            Err(e) => return Err(ConfigError::Parse(e.to_string())),
        };
        deep_merge(&mut current, changes);

        let updated: NodeConfig = serde_json::from_value(Value::Object(current))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        if updated.node_id != self.node_id {
            return Err(ConfigError::Invalid {
                field: "node_id",
                reason: "cannot change at runtime".into(),
            });
        }
        if updated.node_type != self.node_type {
            return Err(ConfigError::Invalid {
                field: "node_type",
                reason: "cannot change at runtime".into(),
            });
        }
        updated.validate()?;
        Ok(updated)
    }
}

/// Addressing for both channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// Message channel port.
    pub port: u16,
    /// Broadcast channel port.
    pub discovery_port: u16,
    /// Coordinator message address (`host:port`), workers only.
    pub coordinator: Option<String>,
    /// Coordinator broadcast address; derived from `coordinator` when unset.
    pub coordinator_discovery: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            discovery_port: 5556,
            coordinator: None,
            coordinator_discovery: None,
        }
    }
}

impl NetworkConfig {
    pub fn message_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn discovery_address(&self) -> String {
        format!("{}:{}", self.host, self.discovery_port)
    }

    /// Broadcast address a worker subscribes to.
    pub fn coordinator_discovery_address(&self) -> Option<String> {
        if let Some(explicit) = &self.coordinator_discovery {
            return Some(explicit.clone());
        }
        let coordinator = self.coordinator.as_ref()?;
        let host = coordinator
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(coordinator.as_str());
        Some(format!("{}:{}", host, self.discovery_port))
    }
}

/// Loop cadences and timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub discovery_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub offline_threshold_ms: u64,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            offline_threshold_ms: 30_000,
            poll_interval_ms: 100,
            join_timeout_ms: 2_000,
            restart_delay_ms: 1_000,
        }
    }
}

impl TimingConfig {
    /// Short cadences for tests and local demos.
    pub fn for_testing() -> Self {
        Self {
            discovery_interval_ms: 50,
            heartbeat_interval_ms: 40,
            offline_threshold_ms: 300,
            poll_interval_ms: 10,
            join_timeout_ms: 500,
            restart_delay_ms: 50,
        }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("timing.discovery_interval_ms", self.discovery_interval_ms),
            ("timing.heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("timing.offline_threshold_ms", self.offline_threshold_ms),
            ("timing.poll_interval_ms", self.poll_interval_ms),
        ];
        for (field, value) in required {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.offline_threshold_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid {
                field: "timing.offline_threshold_ms",
                reason: format!(
                    "must exceed heartbeat interval ({} ms)",
                    self.heartbeat_interval_ms
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.node_type, NodeType::Worker);
        assert!(config.roles.contains(Role::Detector));
        assert!(config.roles.contains(Role::Protector));
        assert_eq!(config.timing.discovery_interval(), Duration::from_secs(10));
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.timing.offline_threshold(), Duration::from_secs(30));
        assert_eq!(config.network.message_address(), "127.0.0.1:5555");
    }

    #[test]
    fn test_worker_requires_coordinator_address() {
        let err = NodeConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("network.coordinator"));
        assert!(NodeConfig::worker("10.0.0.1:5555").validate().is_ok());
        assert!(NodeConfig::coordinator().validate().is_ok());
    }

    #[test]
    fn test_offline_threshold_must_exceed_heartbeat() {
        let mut config = NodeConfig::coordinator();
        config.timing.offline_threshold_ms = config.timing.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_discovery_address_derived_from_coordinator_host() {
        let mut network = NetworkConfig {
            coordinator: Some("10.1.2.3:7000".into()),
            discovery_port: 7001,
            ..NetworkConfig::default()
        };
        assert_eq!(
            network.coordinator_discovery_address().as_deref(),
            Some("10.1.2.3:7001")
        );

        network.coordinator_discovery = Some("10.9.9.9:9000".into());
        assert_eq!(
            network.coordinator_discovery_address().as_deref(),
            Some("10.9.9.9:9000")
        );
    }

    #[test]
    fn test_merged_with_applies_nested_changes() {
        let config = NodeConfig::coordinator().with_node_id("coord");
        let changes = json!({"timing": {"heartbeat_interval_ms": 1000}, "associated_devices": ["cam-1"]});

        let updated = config
            .merged_with(changes.as_object().unwrap())
            .unwrap();

        assert_eq!(updated.timing.heartbeat_interval_ms, 1000);
        assert_eq!(updated.timing.offline_threshold_ms, 30_000);
        assert_eq!(updated.associated_devices, vec!["cam-1".to_string()]);
    }

    #[test]
    fn test_merged_with_rejects_identity_changes_and_bad_values() {
        let config = NodeConfig::coordinator().with_node_id("coord");

        let rename = json!({"node_id": "other"});
        assert!(config.merged_with(rename.as_object().unwrap()).is_err());

        let retype = json!({"node_type": "worker"});
        assert!(config.merged_with(retype.as_object().unwrap()).is_err());

        let bad_type = json!({"timing": {"heartbeat_interval_ms": "fast"}});
        assert!(config.merged_with(bad_type.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: NodeConfig =
            serde_json::from_value(json!({"node_type": "coordinator", "roles": ["logger"]})).unwrap();
        assert_eq!(config.node_type, NodeType::Coordinator);
        assert!(config.roles.contains(Role::Logger));
        assert_eq!(config.network.port, 5555);
    }
}
