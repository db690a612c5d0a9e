//! # Message Router
//!
//! The message loop and per-type handlers. Every frame first refreshes (or
//! creates) the sender's registry entry, then goes to exactly one handler.
//! Handler failures are logged with the message type and sender and never
//! escape the loop.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{
    AlertRecord, CommandRequest, CommandResponse, CoordinationError, DiscoveryPayload,
    HeartbeatPayload, Message, MessageBody, MessageType, NodeId, NodeStatusPayload, NodeType,
    NodeUpdate, PolicySet, Role, RoleSet, UpsertOutcome, UNKNOWN_ADDRESS,
};
use crate::ports::{InboundFrame, Transport};
use crate::service::core::NodeInner;

/// Receive frames until shutdown, interleaved with alerts raised by the
/// local detector.
pub(crate) async fn run(
    node: Arc<NodeInner>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut local_alerts = node.alert_rx.lock().await;
    debug!(node_id = %node.node_id, "message loop started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = transport.recv_message() => match frame {
                Some(frame) => node.handle_frame(frame).await,
                None => {
                    let backoff = node.timing().poll_interval();
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
            Some(alert) = local_alerts.recv() => node.on_local_alert(alert).await,
        }
    }

    debug!(node_id = %node.node_id, "message loop stopped");
}

impl NodeInner {
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        let message = match Message::decode(&frame.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    peer = ?frame.peer,
                    len = frame.bytes.len(),
                    error = %e,
                    "dropping malformed frame"
                );
                return;
            }
        };

        // The connection identity wins over the self-reported sender.
        let sender = frame
            .peer
            .unwrap_or_else(|| message.sender_id().clone());
        self.dispatch(&sender, message).await;
    }

    /// Route one decoded message from `sender`.
    pub(crate) async fn dispatch(self: &Arc<Self>, sender: &NodeId, message: Message) {
        if *sender == self.node_id {
            debug!(node_id = %self.node_id, msg_type = %message.kind(), "ignoring own message");
            return;
        }

        self.note_contact(sender, &message);

        let result = match message.body() {
            Ok(MessageBody::Discovery(payload)) => {
                self.on_discovery(payload);
                Ok(())
            }
            Ok(MessageBody::Heartbeat(payload)) => {
                self.on_heartbeat(sender, &message, payload);
                Ok(())
            }
            Ok(MessageBody::Alert(alert)) => self.on_alert(sender, &message, alert).await,
            Ok(MessageBody::PolicyUpdate(policies)) => {
                self.on_policy_update(sender, &message, policies).await
            }
            Ok(MessageBody::NodeStatus(payload)) => {
                self.on_node_status(sender, &message, payload).await;
                Ok(())
            }
            Ok(MessageBody::Command(request)) => self.on_command(sender, request).await,
            Ok(MessageBody::CommandResponse(response)) => {
                self.on_command_response(sender, response);
                Ok(())
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            warn!(
                node_id = %self.node_id,
                msg_type = %message.kind(),
                sender = %sender,
                sent_at = %message.timestamp(),
                error = %e,
                "message handler failed"
            );
        }
    }

    /// Refresh a known sender; register an unknown one with whatever the
    /// envelope and payload reveal.
    fn note_contact(&self, sender: &NodeId, message: &Message) {
        let now = self.now();
        if self.registry.touch(sender, now) {
            return;
        }

        let mut update = NodeUpdate::seen(now).with_type(message.sender_type());
        let payload = message.payload();
        if let Some(roles) = payload
            .get("roles")
            .and_then(|v| serde_json::from_value::<RoleSet>(v.clone()).ok())
        {
            update = update.with_roles(roles);
        }
        if message.kind() == MessageType::NodeStatus
            && payload.get("node_id").and_then(Value::as_str) == Some(sender.as_str())
        {
            if let Some(address) = payload.get("address").and_then(Value::as_str) {
                update = update.with_address(address);
            }
        }

        if self.registry.upsert(sender, update) == UpsertOutcome::Inserted {
            info!(
                node_id = %self.node_id,
                peer = %sender,
                peer_type = %message.sender_type(),
                via = %message.kind(),
                "registered new peer"
            );
        }
    }

    /// First sighting registers the coordinator; later ones only refresh
    /// `last_seen` (and fill in an address learned too early to carry one).
    pub(crate) fn on_discovery(&self, payload: DiscoveryPayload) {
        if payload.coordinator_id == self.node_id {
            return;
        }
        let now = self.now();
        match self.registry.get(&payload.coordinator_id) {
            Some(existing) if existing.address != UNKNOWN_ADDRESS => {
                self.registry.touch(&payload.coordinator_id, now);
            }
            known => {
                self.registry.upsert(
                    &payload.coordinator_id,
                    NodeUpdate::seen(now)
                        .with_type(NodeType::Coordinator)
                        .with_address(payload.message_address.clone()),
                );
                if known.is_none() {
                    info!(
                        node_id = %self.node_id,
                        coordinator = %payload.coordinator_id,
                        message_address = %payload.message_address,
                        discovery_address = %payload.discovery_address,
                        "discovered coordinator"
                    );
                }
            }
        }
    }

    fn on_heartbeat(&self, sender: &NodeId, message: &Message, payload: HeartbeatPayload) {
        self.registry.upsert(
            sender,
            NodeUpdate::seen(self.now())
                .with_type(message.sender_type())
                .with_roles(payload.roles)
                .with_status(payload.status),
        );
        debug!(node_id = %self.node_id, peer = %sender, status = %payload.status, "heartbeat received");
    }

    async fn on_alert(
        &self,
        sender: &NodeId,
        message: &Message,
        alert: AlertRecord,
    ) -> Result<(), CoordinationError> {
        info!(
            node_id = %self.node_id,
            sender = %sender,
            origin = ?message.relayed_from(),
            alert_type = %alert.alert_type,
            confidence = alert.confidence,
            device_id = %alert.device_id,
            "alert received"
        );
        self.collaborators.logger.log_alert(&alert);
        self.relay(message, sender).await;

        if self.has_role(Role::Protector) {
            if let Some(protector) = &self.collaborators.protector {
                protector.handle_alert(&alert)?;
            }
        }
        Ok(())
    }

    async fn on_policy_update(
        &self,
        sender: &NodeId,
        message: &Message,
        policies: PolicySet,
    ) -> Result<(), CoordinationError> {
        let merged = self.merge_policies(&policies);
        info!(
            node_id = %self.node_id,
            sender = %sender,
            updated_keys = policies.len(),
            total_keys = merged.len(),
            "policies updated"
        );
        self.relay(message, sender).await;
        self.push_policies(&merged)
    }

    async fn on_node_status(&self, sender: &NodeId, message: &Message, payload: NodeStatusPayload) {
        let subject = payload.node_id.clone();
        if subject == self.node_id {
            debug!(node_id = %self.node_id, sender = %sender, status = %payload.status, "ignoring status about self");
        } else if payload.status.is_departure() {
            if self.registry.remove(&subject).is_some() {
                info!(
                    node_id = %self.node_id,
                    peer = %subject,
                    status = %payload.status,
                    reported_by = %sender,
                    "peer left the mesh"
                );
            }
        } else {
            let mut update = NodeUpdate::seen(self.now()).with_status(payload.status);
            if let Some(node_type) = payload.node_type {
                update = update.with_type(node_type);
            }
            if let Some(roles) = payload.roles {
                update = update.with_roles(roles);
            }
            if let Some(address) = payload.address {
                update = update.with_address(address);
            }
            self.registry.upsert(&subject, update);
            debug!(node_id = %self.node_id, peer = %subject, status = %payload.status, "peer status updated");
        }

        self.relay(message, sender).await;
    }

    async fn on_command(
        self: &Arc<Self>,
        sender: &NodeId,
        request: CommandRequest,
    ) -> Result<(), CoordinationError> {
        info!(
            node_id = %self.node_id,
            sender = %sender,
            command = %request.command,
            command_id = %request.command_id,
            "command received"
        );
        let result = self.execute_command(&request);
        let response = CommandResponse {
            command_id: request.command_id,
            result,
        };
        let reply = self.message(MessageType::CommandResponse, &response)?;
        self.send_to_peer(sender, &reply).await
    }

    fn on_command_response(&self, sender: &NodeId, response: CommandResponse) {
        match self.pending_commands.lock().remove(&response.command_id) {
            Some(waiter) => {
                let _ = waiter.send(response.result);
            }
            None => debug!(
                node_id = %self.node_id,
                sender = %sender,
                command_id = %response.command_id,
                "response for unknown command"
            ),
        }
    }

    /// Alert from the local detector: log, protect locally, then tell the
    /// mesh.
    pub(crate) async fn on_local_alert(&self, alert: AlertRecord) {
        let alert = if alert.timestamp == 0.0 {
            alert.at(self.now())
        } else {
            alert
        };
        info!(
            node_id = %self.node_id,
            alert_type = %alert.alert_type,
            confidence = alert.confidence,
            device_id = %alert.device_id,
            "local detector raised alert"
        );
        self.collaborators.logger.log_alert(&alert);

        if self.has_role(Role::Protector) {
            if let Some(protector) = &self.collaborators.protector {
                if let Err(e) = protector.handle_alert(&alert) {
                    warn!(node_id = %self.node_id, error = %e, "local protector failed to handle alert");
                }
            }
        }

        if let Err(e) = self.broadcast(MessageType::Alert, &alert).await {
            warn!(node_id = %self.node_id, alert_type = %alert.alert_type, error = %e, "failed to propagate alert");
        }
    }
}
