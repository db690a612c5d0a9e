//! # TCP Loopback
//!
//! Coordinator and two workers over real sockets on 127.0.0.1, with the
//! coordinator bound to ephemeral ports.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use mesh_coordination::{
    AlertRecord, ManualDetector, NodeConfig, NodeId, NodeStatus, RecordingProtectionEngine, Role,
    RoleSet, SecurityNode, TcpTransportBinder, TimingConfig, TracingAlertLogger, CHANGE_ROLE,
};

use super::support::{init_tracing, wait_until};

struct TcpNode {
    node: SecurityNode,
    logger: Arc<TracingAlertLogger>,
    protector: Arc<RecordingProtectionEngine>,
    detector: Arc<ManualDetector>,
}

fn build(config: NodeConfig) -> TcpNode {
    build_with_timing(config, TimingConfig::for_testing())
}

fn build_with_timing(config: NodeConfig, timing: TimingConfig) -> TcpNode {
    let logger = Arc::new(TracingAlertLogger::default());
    let protector = Arc::new(RecordingProtectionEngine::new());
    let detector = Arc::new(ManualDetector::new());
    let node = SecurityNode::builder(config.with_timing(timing))
        .transport(Arc::new(TcpTransportBinder))
        .alert_logger(logger.clone())
        .protection_engine(protector.clone())
        .detector(detector.clone())
        .build()
        .unwrap();
    TcpNode {
        node,
        logger,
        protector,
        detector,
    }
}

async fn start_coordinator() -> TcpNode {
    let mut config = NodeConfig::coordinator()
        .with_node_id("coord")
        .with_roles(RoleSet::from([Role::Logger]));
    config.network.port = 0;
    config.network.discovery_port = 0;
    let coord = build(config);
    coord.node.start().await.unwrap();
    coord
}

fn worker_config(id: &str, roles: RoleSet, coord: &SecurityNode) -> NodeConfig {
    let mut config = NodeConfig::worker(coord.message_address().unwrap())
        .with_node_id(id)
        .with_roles(roles);
    config.network.coordinator_discovery = coord.discovery_address();
    config
}

async fn start_worker(id: &str, roles: RoleSet, coord: &SecurityNode) -> TcpNode {
    let worker = build(worker_config(id, roles, coord));
    worker.node.start().await.unwrap();
    worker
}

#[tokio::test]
async fn test_star_over_tcp() {
    init_tracing();
    let coord = start_coordinator().await;
    let alpha = start_worker("alpha", RoleSet::from([Role::Detector]), &coord.node).await;
    let bravo = start_worker("bravo", RoleSet::from([Role::Protector]), &coord.node).await;

    wait_until("coordinator to register both workers", || {
        coord.node.registry().len() == 2
    })
    .await;
    let advertised = coord.node.message_address();
    wait_until("alpha to learn the coordinator address", || {
        alpha
            .node
            .registry()
            .get(&NodeId::new("coord"))
            .map(|seen| seen.address)
            == advertised
    })
    .await;

    // Detector alert: alpha -> coord -> bravo.
    assert!(alpha.detector.raise(AlertRecord::new("brute_force", 0.8, "nas-1")));
    wait_until("coordinator to log the alert", || coord.logger.len() == 1).await;
    wait_until("bravo to act on the alert", || {
        bravo.protector.handled_alerts().len() == 1
    })
    .await;

    // Command round-trip over the coordinator's per-worker connection.
    let result = coord
        .node
        .send_command(
            &NodeId::new("bravo"),
            CHANGE_ROLE,
            json!({"roles": ["protector", "logger"]})
                .as_object()
                .cloned()
                .unwrap(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(result.success, "{}", result.message);
    assert!(bravo.node.roles().contains(Role::Logger));

    // Departure is announced before the socket closes.
    alpha.node.stop().await.unwrap();
    assert_eq!(alpha.node.status(), NodeStatus::Inactive);
    wait_until("coordinator to drop alpha", || {
        !coord.node.registry().contains(&NodeId::new("alpha"))
    })
    .await;

    bravo.node.stop().await.unwrap();
    coord.node.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_degrades_when_coordinator_goes_away() {
    init_tracing();
    let coord = start_coordinator().await;
    let worker = start_worker("alpha", RoleSet::from([Role::Protector]), &coord.node).await;

    wait_until("worker to reach the coordinator", || {
        coord.node.registry().contains(&NodeId::new("alpha"))
    })
    .await;

    coord.node.stop().await.unwrap();
    wait_until("worker to degrade", || {
        worker.node.status() == NodeStatus::Degraded
    })
    .await;

    worker.node.stop().await.unwrap();
    assert_eq!(worker.node.status(), NodeStatus::Inactive);
}

#[tokio::test]
async fn test_started_worker_is_active_and_heard_at_once() {
    init_tracing();
    let coord = start_coordinator().await;

    // Long enough that only the first heartbeat can land in the window below.
    let timing = TimingConfig {
        heartbeat_interval_ms: 2_000,
        offline_threshold_ms: 10_000,
        ..TimingConfig::for_testing()
    };
    let worker = build_with_timing(
        worker_config("alpha", RoleSet::from([Role::Protector]), &coord.node),
        timing,
    );
    worker.node.start().await.unwrap();
    assert_eq!(worker.node.status(), NodeStatus::Active);

    tokio::time::timeout(
        Duration::from_millis(1_000),
        wait_until("coordinator to hear the first heartbeat", || {
            coord.node.registry().contains(&NodeId::new("alpha"))
        }),
    )
    .await
    .expect("first heartbeat was not delivered");
    assert_eq!(worker.node.status(), NodeStatus::Active);

    worker.node.stop().await.unwrap();
    coord.node.stop().await.unwrap();
}
