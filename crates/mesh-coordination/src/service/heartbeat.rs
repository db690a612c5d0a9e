//! # Heartbeat Monitor
//!
//! Each tick announces liveness (coordinators to every peer, workers
//! upstream), records the local heartbeat time and sweeps stale peers.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{
    HeartbeatPayload, MessageType, NodeId, NodeStatus, NodeStatusPayload, CoordinationError,
};
use crate::service::core::NodeInner;

pub(crate) async fn run(node: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    debug!(node_id = %node.node_id, "heartbeat loop started");

    loop {
        node.heartbeat_tick().await;

        let interval = node.timing().heartbeat_interval();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(node_id = %node.node_id, "heartbeat loop stopped");
}

impl NodeInner {
    async fn heartbeat_tick(&self) {
        match self.send_heartbeat().await {
            Ok(()) => self.mark_reachable().await,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "heartbeat not delivered");
                if !self.is_coordinator() {
                    self.mark_degraded();
                }
            }
        }
        *self.last_heartbeat.write() = Some(self.now());
        self.sweep_offline_peers().await;
    }

    async fn send_heartbeat(&self) -> Result<(), CoordinationError> {
        let payload = HeartbeatPayload {
            status: self.status(),
            roles: self.roles(),
        };
        let message = self.message(MessageType::Heartbeat, &payload)?;

        if self.is_coordinator() {
            let sent = self.fan_out(&message, None).await?;
            debug!(node_id = %self.node_id, recipients = sent, "heartbeat sent");
        } else {
            let transport = self.current_transport()?;
            transport.send_upstream(message.encode()?).await?;
        }
        Ok(())
    }

    fn mark_degraded(&self) {
        let mut status = self.status.write();
        if *status == NodeStatus::Active {
            *status = NodeStatus::Degraded;
            warn!(node_id = %self.node_id, "coordinator unreachable, node degraded");
        }
    }

    async fn mark_reachable(&self) {
        let recovered = {
            let mut status = self.status.write();
            if *status == NodeStatus::Degraded {
                *status = NodeStatus::Active;
                true
            } else {
                false
            }
        };
        if recovered {
            info!(node_id = %self.node_id, "coordinator reachable again, node active");
            if let Err(e) = self.announce_status(NodeStatus::Active).await {
                debug!(node_id = %self.node_id, error = %e, "recovery announcement not delivered");
            }
        }
    }

    /// Remove every peer silent for longer than the offline threshold.
    pub(crate) async fn sweep_offline_peers(&self) -> Vec<NodeId> {
        let now = self.now();
        let threshold = self.timing().offline_threshold();
        let stale = self.registry.stale(now, threshold);

        for peer in &stale {
            let Some(descriptor) = self.registry.remove(peer) else {
                continue;
            };
            warn!(
                node_id = %self.node_id,
                peer = %peer,
                last_seen = %descriptor.last_seen,
                threshold_ms = threshold.as_millis() as u64,
                "peer timed out, marked offline"
            );

            if self.is_coordinator() {
                let payload = NodeStatusPayload {
                    node_id: peer.clone(),
                    status: NodeStatus::Offline,
                    node_type: Some(descriptor.node_type),
                    roles: None,
                    address: None,
                };
                let announced = match self.message(MessageType::NodeStatus, &payload) {
                    Ok(message) => self.fan_out(&message, Some(peer)).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = announced {
                    debug!(node_id = %self.node_id, peer = %peer, error = %e, "offline announcement not delivered");
                }
            }
        }
        stale
    }
}
