//! Outbound delivery shared by the loops and the facade.
//!
//! Coordinators address peers individually; workers only ever talk
//! upstream and rely on the coordinator to relay anything marked
//! `broadcast`.

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{
    CoordinationError, Message, MessageType, NodeId, NodeStatus, NodeStatusPayload,
};
use crate::service::core::NodeInner;

impl NodeInner {
    /// Build a message from this node, stamped with the local clock.
    pub(crate) fn message<P: Serialize>(
        &self,
        kind: MessageType,
        payload: &P,
    ) -> Result<Message, CoordinationError> {
        Ok(Message::new(
            kind,
            self.node_id.clone(),
            self.node_type,
            payload,
            self.now(),
        )?)
    }

    /// Send to one peer. On a worker the only reachable peer is the
    /// coordinator, so `peer` is ignored and the frame goes upstream.
    pub(crate) async fn send_to_peer(
        &self,
        peer: &NodeId,
        message: &Message,
    ) -> Result<(), CoordinationError> {
        let transport = self.current_transport()?;
        let frame = message.encode()?;
        if self.is_coordinator() {
            transport.send_to(peer, frame).await?;
        } else {
            transport.send_upstream(frame).await?;
        }
        Ok(())
    }

    /// Send to every known peer except `skip` (coordinator), or upstream
    /// (worker). Per-peer failures are logged and skipped. Returns the
    /// number of frames delivered.
    pub(crate) async fn fan_out(
        &self,
        message: &Message,
        skip: Option<&NodeId>,
    ) -> Result<usize, CoordinationError> {
        let transport = self.current_transport()?;
        let frame = message.encode()?;

        if !self.is_coordinator() {
            transport.send_upstream(frame).await?;
            return Ok(1);
        }

        let mut delivered = 0;
        for peer in self.registry.ids_except(skip) {
            match transport.send_to(&peer, frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    node_id = %self.node_id,
                    peer = %peer,
                    msg_type = %message.kind(),
                    error = %e,
                    "failed to deliver to peer"
                ),
            }
        }
        Ok(delivered)
    }

    /// Send a locally originated message with `broadcast` set.
    pub(crate) async fn broadcast<P: Serialize>(
        &self,
        kind: MessageType,
        payload: &P,
    ) -> Result<usize, CoordinationError> {
        let message = self.message(kind, payload)?.with_broadcast(true);
        self.fan_out(&message, None).await
    }

    /// Re-send a peer's broadcast message to everyone else. Only
    /// coordinators relay, only relayable kinds, and only once: the relayed
    /// copy has `broadcast` cleared.
    pub(crate) async fn relay(&self, message: &Message, origin: &NodeId) {
        if !self.is_coordinator() || !message.is_broadcast() {
            return;
        }
        if !message.kind().is_relayable() {
            debug!(
                node_id = %self.node_id,
                msg_type = %message.kind(),
                origin = %origin,
                "broadcast flag ignored for non-relayable message"
            );
            return;
        }
        let relayed = message.relayed_by(self.node_id.clone(), self.now());
        match self.fan_out(&relayed, Some(origin)).await {
            Ok(count) => debug!(
                node_id = %self.node_id,
                msg_type = %message.kind(),
                origin = %origin,
                recipients = count,
                "relayed message"
            ),
            Err(e) => warn!(
                node_id = %self.node_id,
                msg_type = %message.kind(),
                origin = %origin,
                error = %e,
                "relay failed"
            ),
        }
    }

    /// Tell the mesh about this node's status.
    pub(crate) async fn announce_status(
        &self,
        status: NodeStatus,
    ) -> Result<usize, CoordinationError> {
        let (roles, address) = {
            let config = self.config.read();
            (config.roles.clone(), config.network.message_address())
        };
        let address = self
            .transport
            .read()
            .as_ref()
            .map(|t| t.message_address())
            .unwrap_or(address);
        let payload = NodeStatusPayload {
            node_id: self.node_id.clone(),
            status,
            node_type: Some(self.node_type),
            roles: Some(roles),
            address: Some(address),
        };
        self.broadcast(MessageType::NodeStatus, &payload).await
    }
}
