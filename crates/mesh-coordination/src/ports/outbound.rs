//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the coordination layer requires from its host: the two
//! logical channels and a clock.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{NodeConfig, NodeId, Timestamp, TransportError};

/// A frame received on the message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Routing identity of the connection the frame arrived on. Set on the
    /// coordinator side; `None` on workers, whose only peer is upstream.
    pub peer: Option<NodeId>,
    pub bytes: Vec<u8>,
}

/// One node's bound channels.
///
/// - **Message channel**: point-to-point. The coordinator addresses peers by
///   id (`send_to`); a worker only talks upstream (`send_upstream`).
/// - **Broadcast channel**: one-to-many, coordinator to workers (`publish`
///   / `recv_broadcast`).
///
/// # Thread Safety
///
/// All three loops share one transport, so every method takes `&self`.
/// Both `recv_*` methods must be cancel-safe: the loops race them against
/// the shutdown signal in `tokio::select!`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to a connected peer (coordinator side).
    async fn send_to(&self, peer: &NodeId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Send to the coordinator (worker side).
    async fn send_upstream(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Publish on the broadcast channel (coordinator side).
    async fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next frame from the message channel. `None` once the transport is closed.
    async fn recv_message(&self) -> Option<InboundFrame>;

    /// Next frame from the broadcast channel (worker side). `None` once the
    /// transport is closed, or always on the coordinator.
    async fn recv_broadcast(&self) -> Option<Vec<u8>>;

    /// Actual message channel address (resolves port 0 binds).
    fn message_address(&self) -> String;

    /// Actual broadcast channel address.
    fn discovery_address(&self) -> String;

    /// Release sockets and background tasks. Idempotent.
    async fn close(&self);
}

/// Binds a fresh `Transport` for each `start()`.
///
/// Coordinators bind and listen; workers connect to the configured
/// coordinator addresses.
#[async_trait]
pub trait TransportBinder: Send + Sync {
    async fn bind(
        &self,
        local_id: &NodeId,
        config: &NodeConfig,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Abstract clock, injectable for deterministic liveness tests.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}
