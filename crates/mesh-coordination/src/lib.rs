//! # Mesh Coordination
//!
//! Messaging and coordination substrate for Sentinel Mesh security nodes.
//!
//! Nodes form a star: one **coordinator** and any number of **workers**.
//! Workers find the coordinator through its periodic discovery broadcast,
//! keep it informed with heartbeats and push alerts upstream; the
//! coordinator relays anything marked `broadcast` to every other worker
//! and announces peers that go silent as offline.
//!
//! Each node carries a set of roles (`detector`, `protector`, `logger`)
//! that decide which local collaborators it drives. Detection and
//! protection logic itself is plugged in through the ports.
//!
//! ## Architecture
//!
//! - **Domain Layer:** registry, wire messages, policy merge, configuration
//! - **Ports Layer:** transport, clock and collaborator traits
//! - **Service Layer:** `SecurityNode` and its discovery, message and
//!   heartbeat loops
//! - **Adapters Layer:** TCP and in-memory transports, clocks, TOML config,
//!   default collaborators
//!
//! ## Features
//!
//! - `tcp` - TCP transport (default)
//! - `config-file` - TOML config loading (default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_coordination::{MemoryNetwork, NodeConfig, SecurityNode};
//!
//! # async fn demo() -> Result<(), mesh_coordination::CoordinationError> {
//! let network = MemoryNetwork::new();
//!
//! let coordinator = SecurityNode::builder(NodeConfig::coordinator().with_node_id("coord"))
//!     .transport(Arc::new(network.clone()))
//!     .build()?;
//! let worker = SecurityNode::builder(NodeConfig::worker("127.0.0.1:5555"))
//!     .transport(Arc::new(network))
//!     .build()?;
//!
//! coordinator.start().await?;
//! worker.start().await?;
//! // ...
//! worker.stop().await?;
//! coordinator.stop().await?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod domain;
pub mod ports;
pub mod service;

/// Transports, clocks, config loading and default collaborators.
/// TCP and TOML adapters are feature-gated.
pub mod adapters;

// =============================================================================
// CORE RE-EXPORTS
// =============================================================================

pub use domain::{
    deep_merge, AlertRecord, CollaboratorError, CommandRequest, CommandResponse, CommandResult,
    ConfigError, CodecError, CoordinationError, DiscoveryPayload, HeartbeatPayload, Message,
    MessageBody, MessageType, NetworkConfig, NodeConfig, NodeDescriptor, NodeId, NodeRegistry,
    NodeStatus, NodeStatusPayload, NodeType, NodeUpdate, PolicySet, RegistryStats, Role, RoleSet,
    Severity, Timestamp, TimingConfig, TransportError, UpsertOutcome, MAX_FRAME_SIZE,
    UNKNOWN_ADDRESS,
};

pub use ports::{
    AlertCallback, AlertLogger, Detector, InboundFrame, ProtectionEngine, TimeSource, Transport,
    TransportBinder,
};

pub use service::{
    Command, NodeSnapshot, SecurityNode, SecurityNodeBuilder, CHANGE_ROLE, RESTART, UPDATE_CONFIG,
};

// =============================================================================
// ADAPTER RE-EXPORTS
// =============================================================================

pub use adapters::{
    ManualDetector, ManualTimeSource, MemoryNetwork, RecordingProtectionEngine, SystemTimeSource,
    TracingAlertLogger,
};

#[cfg(feature = "tcp")]
pub use adapters::{TcpTransport, TcpTransportBinder};

#[cfg(feature = "config-file")]
pub use adapters::TomlConfigLoader;
