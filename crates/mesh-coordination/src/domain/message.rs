//! # Wire Messages
//!
//! Every frame on either channel is one JSON object:
//!
//! ```text
//! { "type": <enum string>, "sender_id": <string>, "sender_type": "coordinator"|"worker",
//!   "payload": { ... }, "broadcast": <bool>, "timestamp": <float seconds>,
//!   "relayed_from": <string, optional> }
//! ```
//!
//! The envelope is decoded first; the payload is decoded into its typed
//! form per message type by [`Message::body`], so a bad payload fails one
//! handler rather than the whole frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::domain::errors::CodecError;
use crate::domain::policy::PolicySet;
use crate::domain::value_objects::{NodeId, NodeStatus, NodeType, RoleSet, Timestamp};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Message kinds carried on the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Discovery,
    Heartbeat,
    Alert,
    PolicyUpdate,
    NodeStatus,
    Command,
    CommandResponse,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Heartbeat => "heartbeat",
            Self::Alert => "alert",
            Self::PolicyUpdate => "policy_update",
            Self::NodeStatus => "node_status",
            Self::Command => "command",
            Self::CommandResponse => "command_response",
        }
    }

    /// Kinds the coordinator relays when the sender sets `broadcast`.
    pub fn is_relayable(&self) -> bool {
        matches!(self, Self::Alert | Self::PolicyUpdate | Self::NodeStatus)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Coordinator network metadata published on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub coordinator_id: NodeId,
    pub message_address: String,
    pub discovery_address: String,
}

/// Periodic liveness announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: NodeStatus,
    #[serde(default)]
    pub roles: RoleSet,
}

/// Alert severity as recorded by the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

/// An alert raised by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub timestamp: f64,
}

impl AlertRecord {
    pub fn new(alert_type: impl Into<String>, confidence: f64, device_id: impl Into<String>) -> Self {
        Self {
            alert_type: alert_type.into(),
            confidence: confidence.clamp(0.0, 1.0),
            device_id: device_id.into(),
            target_id: None,
            severity: Severity::default(),
            description: String::new(),
            details: Map::new(),
            timestamp: 0.0,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp.as_secs_f64();
        self
    }
}

/// Status of a node announced to the mesh. `node_id` is the subject, which
/// differs from the envelope sender when the coordinator relays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusPayload {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<RoleSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A remote operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl CommandRequest {
    /// New request with a fresh correlation id.
    pub fn new(command: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            params,
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Reply correlated to a `CommandRequest` by `command_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub result: CommandResult,
}

/// Typed view of a message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Discovery(DiscoveryPayload),
    Heartbeat(HeartbeatPayload),
    Alert(AlertRecord),
    PolicyUpdate(PolicySet),
    NodeStatus(NodeStatusPayload),
    Command(CommandRequest),
    CommandResponse(CommandResponse),
}

// =============================================================================
// Envelope
// =============================================================================

/// An immutable, self-describing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageType,
    sender_id: NodeId,
    sender_type: NodeType,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    broadcast: bool,
    timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relayed_from: Option<NodeId>,
}

impl Message {
    /// Build a message from a typed payload.
    pub fn new<P: Serialize>(
        kind: MessageType,
        sender_id: NodeId,
        sender_type: NodeType,
        payload: &P,
        timestamp: Timestamp,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            kind,
            sender_id,
            sender_type,
            payload: serde_json::to_value(payload)?,
            broadcast: false,
            timestamp: timestamp.as_secs_f64(),
            relayed_from: None,
        })
    }

    /// Same message with the `broadcast` flag set.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Copy of this message as re-sent by a relaying coordinator. The copy
    /// is never relayed again.
    #[must_use]
    pub fn relayed_by(&self, relay_id: NodeId, timestamp: Timestamp) -> Self {
        Self {
            kind: self.kind,
            sender_id: relay_id,
            sender_type: NodeType::Coordinator,
            payload: self.payload.clone(),
            broadcast: false,
            timestamp: timestamp.as_secs_f64(),
            relayed_from: Some(self.sender_id.clone()),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sender_id(&self) -> &NodeId {
        &self.sender_id
    }

    pub fn sender_type(&self) -> NodeType {
        self.sender_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_secs_f64(self.timestamp)
    }

    pub fn relayed_from(&self) -> Option<&NodeId> {
        self.relayed_from.as_ref()
    }

    /// Decode the payload into its typed form.
    pub fn body(&self) -> Result<MessageBody, CodecError> {
        Ok(match self.kind {
            MessageType::Discovery => MessageBody::Discovery(self.payload_as("discovery")?),
            MessageType::Heartbeat => MessageBody::Heartbeat(self.payload_as("heartbeat")?),
            MessageType::Alert => MessageBody::Alert(self.payload_as("alert")?),
            MessageType::PolicyUpdate => MessageBody::PolicyUpdate(self.payload_as("policy_update")?),
            MessageType::NodeStatus => MessageBody::NodeStatus(self.payload_as("node_status")?),
            MessageType::Command => MessageBody::Command(self.payload_as("command")?),
            MessageType::CommandResponse => {
                MessageBody::CommandResponse(self.payload_as("command_response")?)
            }
        })
    }

    fn payload_as<T: DeserializeOwned>(&self, kind: &'static str) -> Result<T, CodecError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| CodecError::Payload {
            kind,
            reason: e.to_string(),
        })
    }

    /// Serialize to a frame body.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame body.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Role;
    use serde_json::json;

    fn heartbeat() -> Message {
        Message::new(
            MessageType::Heartbeat,
            NodeId::new("worker-a"),
            NodeType::Worker,
            &HeartbeatPayload {
                status: NodeStatus::Active,
                roles: RoleSet::from([Role::Detector, Role::Protector]),
            },
            Timestamp::from_millis(1_500),
        )
        .unwrap()
    }

    #[test]
    fn test_envelope_field_names_match_wire_format() {
        let value: Value = serde_json::from_slice(&heartbeat().encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "heartbeat",
                "sender_id": "worker-a",
                "sender_type": "worker",
                "payload": {"status": "active", "roles": ["detector", "protector"]},
                "broadcast": false,
                "timestamp": 1.5
            })
        );
    }

    #[test]
    fn test_decode_foreign_frame_with_defaults() {
        let frame = br#"{"type":"policy_update","sender_id":"c","sender_type":"coordinator",
            "payload":{"ddos":{"threshold":10}},"timestamp":3.0}"#;
        let msg = Message::decode(frame).unwrap();

        assert_eq!(msg.kind(), MessageType::PolicyUpdate);
        assert!(!msg.is_broadcast());
        assert_eq!(msg.timestamp(), Timestamp::from_millis(3_000));
        match msg.body().unwrap() {
            MessageBody::PolicyUpdate(policies) => {
                assert_eq!(policies.get("ddos"), Some(&json!({"threshold": 10})));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_a_decode_error() {
        let frame = br#"{"type":"gossip","sender_id":"x","sender_type":"worker","timestamp":1.0}"#;
        assert!(matches!(Message::decode(frame), Err(CodecError::Malformed(_))));
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn test_bad_payload_fails_only_body_decode() {
        let frame = br#"{"type":"command","sender_id":"x","sender_type":"worker",
            "payload":{"command":"restart"},"timestamp":1.0}"#;
        let msg = Message::decode(frame).unwrap();
        let err = msg.body().unwrap_err();
        assert!(matches!(err, CodecError::Payload { kind: "command", .. }));
    }

    #[test]
    fn test_relayed_copy_is_not_rebroadcast() {
        let original = heartbeat().with_broadcast(true);
        let relayed = original.relayed_by(NodeId::new("coord"), Timestamp::from_millis(9_000));

        assert_eq!(relayed.sender_id(), &NodeId::new("coord"));
        assert_eq!(relayed.sender_type(), NodeType::Coordinator);
        assert_eq!(relayed.relayed_from(), Some(&NodeId::new("worker-a")));
        assert!(!relayed.is_broadcast());
        assert_eq!(relayed.payload(), original.payload());
    }

    #[test]
    fn test_alert_confidence_is_clamped() {
        let alert = AlertRecord::new("ddos", 1.7, "camera-1");
        assert_eq!(alert.confidence, 1.0);
        assert_eq!(alert.severity, Severity::High);
    }

    #[test]
    fn test_command_ids_are_unique() {
        let a = CommandRequest::new("restart", Map::new());
        let b = CommandRequest::new("restart", Map::new());
        assert_ne!(a.command_id, b.command_id);
    }
}
