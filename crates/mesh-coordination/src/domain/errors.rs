//! Error types for the coordination layer.
//!
//! None of these terminate a running node: transport, codec and handler
//! failures are logged at the loop boundary and the loop continues. Only
//! the facade surfaces them to callers (`start()`, `send_command()`, ...).

use thiserror::Error;

use crate::domain::value_objects::NodeId;

/// Failures of the two logical channels.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("send to {target} failed: {reason}")]
    Send { target: String, reason: String },

    #[error("peer {0} is not connected")]
    UnknownPeer(NodeId),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("operation not supported by a {0} transport")]
    WrongSide(&'static str),

    #[error("transport closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed frames and payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Configuration problems detected at load or validation time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure reported by an external collaborator (detector, protection
/// engine). Logged by the router, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{component} failed: {reason}")]
pub struct CollaboratorError {
    pub component: &'static str,
    pub reason: String,
}

impl CollaboratorError {
    pub fn new(component: &'static str, reason: impl Into<String>) -> Self {
        Self {
            component,
            reason: reason.into(),
        }
    }
}

/// Top-level errors returned by the `SecurityNode` facade.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("node is not running")]
    NotRunning,

    #[error("command {command_id} timed out waiting for a response")]
    CommandTimeout { command_id: String },

    #[error("command {command_id} was abandoned before a response arrived")]
    CommandAbandoned { command_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::FrameTooLarge {
            size: 2_000_000,
            max: 1_048_576,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 2000000 bytes (max: 1048576)"
        );
        assert_eq!(
            TransportError::UnknownPeer(NodeId::new("node_a")).to_string(),
            "peer node_a is not connected"
        );
    }

    #[test]
    fn test_coordination_error_wraps_sources() {
        let err: CoordinationError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: transport closed");

        let err: CoordinationError = ConfigError::Invalid {
            field: "network.coordinator",
            reason: "required for workers".into(),
        }
        .into();
        assert!(err.to_string().contains("network.coordinator"));
    }
}
