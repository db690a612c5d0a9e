use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{
    AlertRecord, CommandRequest, CommandResult, CoordinationError, MessageType,
    NodeConfig, NodeDescriptor, NodeId, NodeRegistry, NodeStatus, NodeType, PolicySet, Role,
    RoleSet, Timestamp, TimingConfig,
};
use crate::ports::{AlertLogger, Detector, ProtectionEngine, TimeSource, Transport, TransportBinder};
use crate::service::{discovery, heartbeat, router};

/// A running (or stoppable) security node.
///
/// Cheap to clone; every clone drives the same node. Owns the peer
/// registry and the three background loops:
///
/// - **discovery**: coordinators publish their addresses, workers listen
/// - **message**: receives frames and routes them by type
/// - **heartbeat**: announces liveness and sweeps stale peers
///
/// # Example
///
/// ```rust,ignore
/// let node = SecurityNode::builder(NodeConfig::coordinator())
///     .transport(Arc::new(TcpTransportBinder))
///     .alert_logger(Arc::new(TracingAlertLogger::default()))
///     .build()?;
/// node.start().await?;
/// // ...
/// node.stop().await?;
/// ```
#[derive(Clone)]
pub struct SecurityNode {
    pub(crate) inner: Arc<NodeInner>,
}

/// Point-in-time view of a node, as reported by [`SecurityNode::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub roles: RoleSet,
    pub status: NodeStatus,
    pub last_heartbeat: Option<Timestamp>,
    pub connected_nodes: usize,
    pub associated_devices: Vec<String>,
}

/// Collaborators wired by role.
pub(crate) struct Collaborators {
    pub(crate) detector: Option<Arc<dyn Detector>>,
    pub(crate) protector: Option<Arc<dyn ProtectionEngine>>,
    pub(crate) logger: Arc<dyn AlertLogger>,
}

/// Handles owned by one `start()`..`stop()` cycle.
#[derive(Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// State shared by the facade and the loops.
pub(crate) struct NodeInner {
    pub(crate) node_id: NodeId,
    pub(crate) node_type: NodeType,
    pub(crate) config: RwLock<NodeConfig>,
    pub(crate) status: RwLock<NodeStatus>,
    pub(crate) last_heartbeat: RwLock<Option<Timestamp>>,
    pub(crate) registry: NodeRegistry,
    pub(crate) policies: RwLock<PolicySet>,
    pub(crate) collaborators: Collaborators,
    pub(crate) transport: RwLock<Option<Arc<dyn Transport>>>,
    pub(crate) pending_commands: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
    /// Alerts raised by the local detector, drained by the message loop.
    pub(crate) alert_tx: mpsc::UnboundedSender<AlertRecord>,
    pub(crate) alert_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AlertRecord>>,
    binder: Arc<dyn TransportBinder>,
    time_source: Arc<dyn TimeSource>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    callback_registered: AtomicBool,
    detector_running: AtomicBool,
}

/// Builder for [`SecurityNode`].
pub struct SecurityNodeBuilder {
    config: NodeConfig,
    binder: Option<Arc<dyn TransportBinder>>,
    time_source: Option<Arc<dyn TimeSource>>,
    detector: Option<Arc<dyn Detector>>,
    protector: Option<Arc<dyn ProtectionEngine>>,
    logger: Option<Arc<dyn AlertLogger>>,
}

impl SecurityNodeBuilder {
    /// Binder used on every `start()`. Defaults to TCP when the `tcp`
    /// feature is enabled.
    pub fn transport(mut self, binder: Arc<dyn TransportBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn protection_engine(mut self, protector: Arc<dyn ProtectionEngine>) -> Self {
        self.protector = Some(protector);
        self
    }

    /// Audit logger. Defaults to [`TracingAlertLogger`](crate::adapters::TracingAlertLogger).
    pub fn alert_logger(mut self, logger: Arc<dyn AlertLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validate the configuration and assemble the node. A missing
    /// `node_id` is generated here and fixed for the node's lifetime.
    pub fn build(self) -> Result<SecurityNode, CoordinationError> {
        let mut config = self.config;
        config.validate()?;
        let node_id = config.node_id.clone().unwrap_or_else(NodeId::generate);
        config.node_id = Some(node_id.clone());

        let binder = match self.binder {
            Some(binder) => binder,
            None => default_binder()?,
        };
        let time_source = self
            .time_source
            .unwrap_or_else(|| Arc::new(crate::adapters::SystemTimeSource));
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(crate::adapters::TracingAlertLogger::default()));

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let inner = NodeInner {
            node_type: config.node_type,
            registry: NodeRegistry::new(node_id.clone()),
            policies: RwLock::new(config.protection_policies.clone()),
            node_id,
            config: RwLock::new(config),
            status: RwLock::new(NodeStatus::Uninitialized),
            last_heartbeat: RwLock::new(None),
            collaborators: Collaborators {
                detector: self.detector,
                protector: self.protector,
                logger,
            },
            transport: RwLock::new(None),
            pending_commands: Mutex::new(HashMap::new()),
            alert_tx,
            alert_rx: tokio::sync::Mutex::new(alert_rx),
            binder,
            time_source,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            callback_registered: AtomicBool::new(false),
            detector_running: AtomicBool::new(false),
        };
        Ok(SecurityNode {
            inner: Arc::new(inner),
        })
    }
}

#[cfg(feature = "tcp")]
fn default_binder() -> Result<Arc<dyn TransportBinder>, CoordinationError> {
    Ok(Arc::new(crate::adapters::TcpTransportBinder))
}

#[cfg(not(feature = "tcp"))]
fn default_binder() -> Result<Arc<dyn TransportBinder>, CoordinationError> {
    Err(crate::domain::ConfigError::Invalid {
        field: "transport",
        reason: "no transport binder supplied and the `tcp` feature is disabled".into(),
    }
    .into())
}

impl SecurityNode {
    pub fn builder(config: NodeConfig) -> SecurityNodeBuilder {
        SecurityNodeBuilder {
            config,
            binder: None,
            time_source: None,
            detector: None,
            protector: None,
            logger: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Bind the transport, start role collaborators and spawn the loops.
    ///
    /// Calling `start()` on a running node logs a warning and does nothing.
    pub async fn start(&self) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if inner.status().is_running() {
            warn!(node_id = %inner.node_id, "start() called on a running node, ignoring");
            return Ok(());
        }

        let config = inner.config.read().clone();
        let transport = match inner.binder.bind(&inner.node_id, &config).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(node_id = %inner.node_id, error = %e, "failed to bind transport");
                inner.set_status(NodeStatus::Inactive);
                return Err(e.into());
            }
        };
        *inner.transport.write() = Some(Arc::clone(&transport));

        inner.activate_roles(&RoleSet::new(), &config.roles);
        inner.set_status(NodeStatus::Active);
        *inner.last_heartbeat.write() = Some(inner.now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lifecycle.tasks = vec![
            (
                "discovery",
                tokio::spawn(discovery::run(
                    Arc::clone(inner),
                    Arc::clone(&transport),
                    shutdown_rx.clone(),
                )),
            ),
            (
                "message",
                tokio::spawn(router::run(
                    Arc::clone(inner),
                    Arc::clone(&transport),
                    shutdown_rx.clone(),
                )),
            ),
            (
                "heartbeat",
                tokio::spawn(heartbeat::run(Arc::clone(inner), shutdown_rx)),
            ),
        ];
        lifecycle.shutdown = Some(shutdown_tx);

        info!(
            node_id = %inner.node_id,
            node_type = %inner.node_type,
            roles = %config.roles,
            message_address = %transport.message_address(),
            discovery_address = %transport.discovery_address(),
            "security node started"
        );
        Ok(())
    }

    /// Announce departure, signal the loops, join them and close the
    /// transport. A no-op on a node that is not running.
    pub async fn stop(&self) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if !inner.status().is_running() {
            debug!(node_id = %inner.node_id, "stop() called on a stopped node");
            return Ok(());
        }

        if let Err(e) = inner.announce_status(NodeStatus::Leaving).await {
            debug!(node_id = %inner.node_id, error = %e, "leaving announcement not delivered");
        }

        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }

        let roles = inner.roles();
        inner.activate_roles(&roles, &RoleSet::new());

        let join_timeout = inner.timing().join_timeout();
        for (name, mut handle) in lifecycle.tasks.drain(..) {
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(node_id = %inner.node_id, task = name, "loop stopped"),
                Ok(Err(e)) => warn!(node_id = %inner.node_id, task = name, error = %e, "loop task failed"),
                Err(_) => {
                    warn!(
                        node_id = %inner.node_id,
                        task = name,
                        timeout_ms = join_timeout.as_millis() as u64,
                        "loop did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        let transport = inner.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        // Dropping the senders wakes any `send_command` waiters.
        inner.pending_commands.lock().clear();
        inner.set_status(NodeStatus::Inactive);
        info!(node_id = %inner.node_id, "security node stopped");
        Ok(())
    }

    /// Current node state for monitoring.
    pub fn snapshot(&self) -> NodeSnapshot {
        let inner = &self.inner;
        let config = inner.config.read();
        NodeSnapshot {
            node_id: inner.node_id.clone(),
            node_type: inner.node_type,
            roles: config.roles.clone(),
            status: inner.status(),
            last_heartbeat: *inner.last_heartbeat.read(),
            connected_nodes: inner.registry.len(),
            associated_devices: config.associated_devices.clone(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.node_type
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.status()
    }

    pub fn roles(&self) -> RoleSet {
        self.inner.roles()
    }

    pub fn config(&self) -> NodeConfig {
        self.inner.config.read().clone()
    }

    /// Merged local policy state.
    pub fn policies(&self) -> PolicySet {
        self.inner.policies.read().clone()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// Snapshot of known peers, ordered by id.
    pub fn peers(&self) -> Vec<NodeDescriptor> {
        self.inner.registry.all()
    }

    /// Actual message channel address while running.
    pub fn message_address(&self) -> Option<String> {
        self.inner.transport.read().as_ref().map(|t| t.message_address())
    }

    /// Actual broadcast channel address while running.
    pub fn discovery_address(&self) -> Option<String> {
        self.inner.transport.read().as_ref().map(|t| t.discovery_address())
    }

    /// Send an alert to the mesh with `broadcast` set. Coordinators send to
    /// every peer; workers send upstream for relay. Returns the number of
    /// frames delivered.
    pub async fn broadcast_alert(&self, alert: AlertRecord) -> Result<usize, CoordinationError> {
        self.inner.broadcast(MessageType::Alert, &alert).await
    }

    /// Merge `policies` into local state, push the result to the local
    /// protector and propagate the delta to the mesh.
    pub async fn propagate_policy(&self, policies: PolicySet) -> Result<usize, CoordinationError> {
        let merged = self.inner.merge_policies(&policies);
        if let Err(e) = self.inner.push_policies(&merged) {
            warn!(node_id = %self.inner.node_id, error = %e, "local protector rejected policies");
        }
        self.inner.broadcast(MessageType::PolicyUpdate, &policies).await
    }

    /// Announce this node's status to the mesh.
    pub async fn announce_status(&self, status: NodeStatus) -> Result<usize, CoordinationError> {
        self.inner.announce_status(status).await
    }

    /// Send a command and wait up to `timeout` for the correlated response.
    /// Workers always send upstream, whatever `target` is.
    pub async fn send_command(
        &self,
        target: &NodeId,
        command: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<CommandResult, CoordinationError> {
        let request = CommandRequest::new(command, params);
        let command_id = request.command_id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_commands
            .lock()
            .insert(command_id.clone(), tx);

        let message = match self.inner.message(MessageType::Command, &request) {
            Ok(message) => message,
            Err(e) => {
                self.inner.pending_commands.lock().remove(&command_id);
                return Err(e);
            }
        };
        if let Err(e) = self.inner.send_to_peer(target, &message).await {
            self.inner.pending_commands.lock().remove(&command_id);
            return Err(e);
        }
        debug!(node_id = %self.inner.node_id, target = %target, command, command_id = %command_id, "command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CoordinationError::CommandAbandoned { command_id }),
            Err(_) => {
                self.inner.pending_commands.lock().remove(&command_id);
                Err(CoordinationError::CommandTimeout { command_id })
            }
        }
    }

    /// Remove peers not heard from within the offline threshold; on a
    /// coordinator, announce each one offline to the remaining peers.
    /// Runs on every heartbeat tick.
    pub async fn sweep_offline_peers(&self) -> Vec<NodeId> {
        self.inner.sweep_offline_peers().await
    }
}

impl NodeInner {
    pub(crate) fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    pub(crate) fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn roles(&self) -> RoleSet {
        self.config.read().roles.clone()
    }

    pub(crate) fn has_role(&self, role: Role) -> bool {
        self.config.read().roles.contains(role)
    }

    pub(crate) fn timing(&self) -> TimingConfig {
        self.config.read().timing.clone()
    }

    pub(crate) fn is_coordinator(&self) -> bool {
        self.node_type.is_coordinator()
    }

    pub(crate) fn current_transport(&self) -> Result<Arc<dyn Transport>, CoordinationError> {
        self.transport
            .read()
            .clone()
            .ok_or(CoordinationError::NotRunning)
    }

    /// Merge into local policy state and return the merged set.
    pub(crate) fn merge_policies(&self, incoming: &PolicySet) -> PolicySet {
        let mut policies = self.policies.write();
        policies.merge(incoming);
        policies.clone()
    }

    /// Hand merged policies to the protector, if the role is active.
    pub(crate) fn push_policies(&self, merged: &PolicySet) -> Result<(), CoordinationError> {
        if !self.has_role(Role::Protector) {
            return Ok(());
        }
        if let Some(protector) = &self.collaborators.protector {
            protector.update_policies(merged)?;
        }
        Ok(())
    }

    /// Start collaborators for roles in `after` but not `before`, and stop
    /// those in `before` but not `after`.
    pub(crate) fn activate_roles(&self, before: &RoleSet, after: &RoleSet) {
        match (before.contains(Role::Detector), after.contains(Role::Detector)) {
            (false, true) => self.start_detector(),
            (true, false) => self.stop_detector(),
            _ => {}
        }

        let Some(protector) = &self.collaborators.protector else {
            if after.contains(Role::Protector) && !before.contains(Role::Protector) {
                warn!(node_id = %self.node_id, "protector role active but no protection engine supplied");
            }
            return;
        };
        match (before.contains(Role::Protector), after.contains(Role::Protector)) {
            (false, true) => {
                if let Err(e) = protector.start() {
                    error!(node_id = %self.node_id, error = %e, "protection engine failed to start");
                } else if let Err(e) = protector.update_policies(&self.policies.read().clone()) {
                    warn!(node_id = %self.node_id, error = %e, "protection engine rejected initial policies");
                }
            }
            (true, false) => protector.stop(),
            _ => {}
        }
    }

    fn start_detector(&self) {
        let Some(detector) = &self.collaborators.detector else {
            warn!(node_id = %self.node_id, "detector role active but no detector supplied");
            return;
        };

        if !self.callback_registered.swap(true, Ordering::SeqCst) {
            let alerts = self.alert_tx.clone();
            detector.register_alert_callback(Arc::new(move |alert| {
                let _ = alerts.send(alert);
            }));
        }

        if !self.detector_running.swap(true, Ordering::SeqCst) {
            if let Err(e) = detector.start() {
                error!(node_id = %self.node_id, error = %e, "detector failed to start");
                self.detector_running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn stop_detector(&self) {
        if let Some(detector) = &self.collaborators.detector {
            if self.detector_running.swap(false, Ordering::SeqCst) {
                detector.stop();
            }
        }
    }
}
