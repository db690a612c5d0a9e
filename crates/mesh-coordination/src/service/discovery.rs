//! # Discovery
//!
//! Coordinators publish their channel addresses on the broadcast channel at
//! startup and then every `discovery_interval`. Workers listen on it and
//! register the coordinator on first sight; any other message kind arriving
//! there goes through the router.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{CoordinationError, DiscoveryPayload, Message, MessageBody, MessageType};
use crate::ports::Transport;
use crate::service::core::NodeInner;

pub(crate) async fn run(
    node: Arc<NodeInner>,
    transport: Arc<dyn Transport>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(node_id = %node.node_id, "discovery loop started");
    if node.is_coordinator() {
        publish_loop(&node, transport.as_ref(), shutdown).await;
    } else {
        listen_loop(&node, transport.as_ref(), shutdown).await;
    }
    debug!(node_id = %node.node_id, "discovery loop stopped");
}

async fn publish_loop(
    node: &Arc<NodeInner>,
    transport: &dyn Transport,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = node.publish_discovery(transport).await {
            warn!(node_id = %node.node_id, error = %e, "discovery publish failed");
        }

        let interval = node.timing().discovery_interval();
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn listen_loop(
    node: &Arc<NodeInner>,
    transport: &dyn Transport,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = transport.recv_broadcast() => match frame {
                Some(bytes) => node.handle_broadcast_frame(&bytes).await,
                None => {
                    let backoff = node.timing().poll_interval();
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
        }
    }
}

impl NodeInner {
    async fn publish_discovery(&self, transport: &dyn Transport) -> Result<(), CoordinationError> {
        let payload = DiscoveryPayload {
            coordinator_id: self.node_id.clone(),
            message_address: transport.message_address(),
            discovery_address: transport.discovery_address(),
        };
        let message = self.message(MessageType::Discovery, &payload)?;
        transport.publish(message.encode()?).await?;
        debug!(node_id = %self.node_id, "discovery published");
        Ok(())
    }

    async fn handle_broadcast_frame(self: &Arc<Self>, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(node_id = %self.node_id, len = bytes.len(), error = %e, "dropping malformed broadcast frame");
                return;
            }
        };

        if message.kind() != MessageType::Discovery {
            let sender = message.sender_id().clone();
            self.dispatch(&sender, message).await;
            return;
        }

        match message.body() {
            Ok(MessageBody::Discovery(payload)) => self.on_discovery(payload),
            Ok(_) => {}
            Err(e) => warn!(
                node_id = %self.node_id,
                sender = %message.sender_id(),
                error = %e,
                "invalid discovery payload"
            ),
        }
    }
}
