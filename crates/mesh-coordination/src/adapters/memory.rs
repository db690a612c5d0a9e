//! # In-Memory Mesh
//!
//! `MemoryNetwork` is a process-local hub standing in for the network.
//! Coordinators register under their configured message address; workers
//! reach them through `network.coordinator` and subscribe to the broadcast
//! channel at the coordinator's discovery address. Used by the test suite
//! and for single-process demos.
//!
//! `partition()` cuts a node off: sends from or to it fail and its
//! broadcast subscription goes quiet until `heal()`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::close_signal::CloseSignal;
use crate::domain::{NodeConfig, NodeId, NodeType, TransportError, MAX_FRAME_SIZE};
use crate::ports::{InboundFrame, Transport, TransportBinder};

const BROADCAST_CAPACITY: usize = 256;

type Inbox = mpsc::UnboundedSender<InboundFrame>;

struct CoordinatorEndpoint {
    node_id: NodeId,
    inbox: Inbox,
    workers: HashMap<NodeId, Inbox>,
}

#[derive(Default)]
struct HubState {
    coordinators: HashMap<String, CoordinatorEndpoint>,
    discovery: HashMap<String, broadcast::Sender<Vec<u8>>>,
    partitioned: HashSet<NodeId>,
}

impl HubState {
    fn discovery_channel(&mut self, address: &str) -> broadcast::Sender<Vec<u8>> {
        self.discovery
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }
}

/// Shared in-process network. Clone freely; clones share one hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<HubState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut `node` off from the mesh.
    pub fn partition(&self, node: &NodeId) {
        self.state.lock().partitioned.insert(node.clone());
    }

    pub fn heal(&self, node: &NodeId) {
        self.state.lock().partitioned.remove(node);
    }

    pub fn is_partitioned(&self, node: &NodeId) -> bool {
        self.state.lock().partitioned.contains(node)
    }

    /// Message addresses with a bound coordinator.
    pub fn coordinator_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.state.lock().coordinators.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

#[async_trait]
impl TransportBinder for MemoryNetwork {
    async fn bind(
        &self,
        local_id: &NodeId,
        config: &NodeConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        let side = match config.node_type {
            NodeType::Coordinator => {
                let address = config.network.message_address();
                if let Some(existing) = state.coordinators.get(&address) {
                    if existing.node_id != *local_id {
                        return Err(TransportError::Bind {
                            address,
                            reason: format!("address in use by {}", existing.node_id),
                        });
                    }
                }
                state.coordinators.insert(
                    address,
                    CoordinatorEndpoint {
                        node_id: local_id.clone(),
                        inbox: inbox_tx.clone(),
                        workers: HashMap::new(),
                    },
                );
                let publisher = state.discovery_channel(&config.network.discovery_address());
                Side::Coordinator { publisher }
            }
            NodeType::Worker => {
                let upstream = config.network.coordinator.clone().ok_or_else(|| {
                    TransportError::Connect {
                        address: "<unset>".into(),
                        reason: "no coordinator address configured".into(),
                    }
                })?;
                let discovery = config
                    .network
                    .coordinator_discovery_address()
                    .unwrap_or_else(|| upstream.clone());
                let subscription = state.discovery_channel(&discovery).subscribe();
                Side::Worker {
                    upstream,
                    subscription: tokio::sync::Mutex::new(subscription),
                }
            }
        };
        drop(state);

        Ok(Arc::new(MemoryTransport {
            hub: self.clone(),
            local_id: local_id.clone(),
            side,
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox_rx),
            message_address: config.network.message_address(),
            discovery_address: config.network.discovery_address(),
            closed: CloseSignal::new(),
        }))
    }
}

enum Side {
    Coordinator {
        publisher: broadcast::Sender<Vec<u8>>,
    },
    Worker {
        upstream: String,
        subscription: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
    },
}

/// One node's view of the hub.
pub struct MemoryTransport {
    hub: MemoryNetwork,
    local_id: NodeId,
    side: Side,
    inbox_tx: Inbox,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundFrame>>,
    message_address: String,
    discovery_address: String,
    closed: CloseSignal,
}

impl MemoryTransport {
    fn check_outbound(&self, target: &str, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        if self.hub.is_partitioned(&self.local_id) {
            return Err(TransportError::Send {
                target: target.to_string(),
                reason: "network partitioned".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, peer: &NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        if !matches!(self.side, Side::Coordinator { .. }) {
            return Err(TransportError::WrongSide("worker"));
        }
        self.check_outbound(peer.as_str(), &frame)?;

        let mut state = self.hub.state.lock();
        if state.partitioned.contains(peer) {
            return Err(TransportError::Send {
                target: peer.to_string(),
                reason: "network partitioned".into(),
            });
        }
        let endpoint = state
            .coordinators
            .get_mut(&self.message_address)
            .ok_or(TransportError::Closed)?;
        let inbox = endpoint
            .workers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        let delivered = inbox.send(InboundFrame { peer: None, bytes: frame }).is_ok();
        if !delivered {
            endpoint.workers.remove(peer);
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        Ok(())
    }

    async fn send_upstream(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let Side::Worker { upstream, .. } = &self.side else {
            return Err(TransportError::WrongSide("coordinator"));
        };
        self.check_outbound(upstream, &frame)?;

        let mut guard = self.hub.state.lock();
        let state = &mut *guard;
        let endpoint = state
            .coordinators
            .get_mut(upstream)
            .ok_or_else(|| TransportError::Connect {
                address: upstream.clone(),
                reason: "no coordinator bound".into(),
            })?;
        if state.partitioned.contains(&endpoint.node_id) {
            return Err(TransportError::Send {
                target: upstream.clone(),
                reason: "network partitioned".into(),
            });
        }
        endpoint
            .workers
            .insert(self.local_id.clone(), self.inbox_tx.clone());
        endpoint
            .inbox
            .send(InboundFrame {
                peer: Some(self.local_id.clone()),
                bytes: frame,
            })
            .map_err(|_| TransportError::Send {
                target: upstream.clone(),
                reason: "coordinator inbox closed".into(),
            })
    }

    async fn publish(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let Side::Coordinator { publisher } = &self.side else {
            return Err(TransportError::WrongSide("worker"));
        };
        self.check_outbound(&self.discovery_address, &frame)?;
        // No subscribers yet is not an error.
        let _ = publisher.send(frame);
        Ok(())
    }

    async fn recv_message(&self) -> Option<InboundFrame> {
        if self.closed.is_closed() {
            return None;
        }
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.closed.closed() => None,
            frame = inbox.recv() => frame,
        }
    }

    async fn recv_broadcast(&self) -> Option<Vec<u8>> {
        let Side::Worker { subscription, .. } = &self.side else {
            return None;
        };
        if self.closed.is_closed() {
            return None;
        }
        let mut subscription = subscription.lock().await;
        loop {
            let received = tokio::select! {
                _ = self.closed.closed() => return None,
                received = subscription.recv() => received,
            };
            match received {
                Ok(frame) if !self.hub.is_partitioned(&self.local_id) => return Some(frame),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn message_address(&self) -> String {
        self.message_address.clone()
    }

    fn discovery_address(&self) -> String {
        self.discovery_address.clone()
    }

    async fn close(&self) {
        if !self.closed.close() {
            return;
        }
        let mut state = self.hub.state.lock();
        match &self.side {
            Side::Coordinator { .. } => {
                let owned = state
                    .coordinators
                    .get(&self.message_address)
                    .is_some_and(|endpoint| endpoint.node_id == self.local_id);
                if owned {
                    state.coordinators.remove(&self.message_address);
                }
            }
            Side::Worker { upstream, .. } => {
                if let Some(endpoint) = state.coordinators.get_mut(upstream) {
                    endpoint.workers.remove(&self.local_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator_config() -> NodeConfig {
        NodeConfig::coordinator().with_node_id("coord")
    }

    fn worker_config(id: &str) -> NodeConfig {
        NodeConfig::worker("127.0.0.1:5555").with_node_id(id)
    }

    async fn bind(hub: &MemoryNetwork, config: &NodeConfig) -> Arc<dyn Transport> {
        let id = config.node_id.clone().unwrap();
        hub.bind(&id, config).await.unwrap()
    }

    #[tokio::test]
    async fn test_upstream_frames_carry_worker_identity() {
        let hub = MemoryNetwork::new();
        let coordinator = bind(&hub, &coordinator_config()).await;
        let worker = bind(&hub, &worker_config("w1")).await;

        worker.send_upstream(b"hello".to_vec()).await.unwrap();
        let frame = coordinator.recv_message().await.unwrap();
        assert_eq!(frame.peer, Some(NodeId::new("w1")));
        assert_eq!(frame.bytes, b"hello");

        coordinator
            .send_to(&NodeId::new("w1"), b"back".to_vec())
            .await
            .unwrap();
        let reply = worker.recv_message().await.unwrap();
        assert_eq!(reply.peer, None);
        assert_eq!(reply.bytes, b"back");
    }

    #[tokio::test]
    async fn test_send_to_unconnected_peer_fails() {
        let hub = MemoryNetwork::new();
        let coordinator = bind(&hub, &coordinator_config()).await;

        let err = coordinator
            .send_to(&NodeId::new("ghost"), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_worker_without_coordinator_cannot_send() {
        let hub = MemoryNetwork::new();
        let worker = bind(&hub, &worker_config("w1")).await;

        let err = worker.send_upstream(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(matches!(
            worker.publish(b"x".to_vec()).await,
            Err(TransportError::WrongSide("worker"))
        ));
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = MemoryNetwork::new();
        let w1 = bind(&hub, &worker_config("w1")).await;
        let w2 = bind(&hub, &worker_config("w2")).await;
        let coordinator = bind(&hub, &coordinator_config()).await;

        coordinator.publish(b"discovery".to_vec()).await.unwrap();
        assert_eq!(w1.recv_broadcast().await.unwrap(), b"discovery");
        assert_eq!(w2.recv_broadcast().await.unwrap(), b"discovery");
        assert_eq!(coordinator.recv_broadcast().await, None);
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let hub = MemoryNetwork::new();
        let coordinator = bind(&hub, &coordinator_config()).await;
        let worker = bind(&hub, &worker_config("w1")).await;
        worker.send_upstream(b"join".to_vec()).await.unwrap();
        coordinator.recv_message().await.unwrap();

        hub.partition(&NodeId::new("w1"));
        assert!(worker.send_upstream(b"x".to_vec()).await.is_err());
        assert!(coordinator
            .send_to(&NodeId::new("w1"), b"x".to_vec())
            .await
            .is_err());

        coordinator.publish(b"lost".to_vec()).await.unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(50), worker.recv_broadcast()).await;
        assert!(quiet.is_err());

        hub.heal(&NodeId::new("w1"));
        assert!(worker.send_upstream(b"back".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_releases_address_and_wakes_receivers() {
        let hub = MemoryNetwork::new();
        let coordinator = bind(&hub, &coordinator_config()).await;
        assert_eq!(hub.coordinator_addresses(), vec!["127.0.0.1:5555".to_string()]);

        let other = NodeConfig::coordinator().with_node_id("other");
        assert!(hub.bind(&NodeId::new("other"), &other).await.is_err());

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.recv_message().await })
        };
        coordinator.close().await;
        assert_eq!(pending.await.unwrap(), None);
        assert!(hub.coordinator_addresses().is_empty());
        assert!(matches!(
            coordinator.publish(b"x".to_vec()).await,
            Err(TransportError::Closed)
        ));
    }
}
