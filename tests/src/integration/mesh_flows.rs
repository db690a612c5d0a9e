//! # Mesh Flows
//!
//! Three-node star over the in-memory hub:
//!
//! ```text
//!            [coord]
//!           /       \
//!      [alpha]     [bravo]
//! ```
//!
//! ## Flows Tested
//!
//! 1. **Discovery**: workers find the coordinator, the coordinator learns workers
//! 2. **Alert relay**: a worker alert reaches every other node exactly once
//! 3. **Policy propagation**: deep-merged policies reach every protector
//! 4. **Staleness**: a partitioned worker is timed out and announced offline
//! 5. **Commands**: request/response correlation, role change, restart
//! 6. **Departure**: a stopping worker is dropped everywhere

use serde_json::{json, Map, Value};
use std::time::Duration;

use mesh_coordination::{
    AlertRecord, NodeId, NodeStatus, NodeType, PolicySet, Role, RoleSet, TimeSource, CHANGE_ROLE,
    RESTART, UPDATE_CONFIG,
};

use super::support::{settle, wait_until, Mesh, TestNode};

struct Star {
    mesh: Mesh,
    coord: TestNode,
    alpha: TestNode,
    bravo: TestNode,
}

impl Star {
    /// coord: logger, alpha: detector + protector, bravo: protector.
    async fn start() -> Self {
        let mesh = Mesh::new();
        let coord = mesh.coordinator("coord", RoleSet::from([Role::Logger]));
        let alpha = mesh.worker("alpha", RoleSet::from([Role::Detector, Role::Protector]));
        let bravo = mesh.worker("bravo", RoleSet::from([Role::Protector]));

        coord.start().await.unwrap();
        alpha.start().await.unwrap();
        bravo.start().await.unwrap();

        let star = Self {
            mesh,
            coord,
            alpha,
            bravo,
        };
        wait_until("coordinator to register both workers", || {
            star.coord.registry().len() == 2
        })
        .await;
        star
    }

    async fn stop(self) {
        self.bravo.stop().await.unwrap();
        self.alpha.stop().await.unwrap();
        self.coord.stop().await.unwrap();
    }
}

fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_workers_and_coordinator_find_each_other() {
    let star = Star::start().await;

    for worker in [&star.alpha, &star.bravo] {
        wait_until("worker to learn the coordinator address", || {
            worker
                .registry()
                .get(&id("coord"))
                .is_some_and(|coord| coord.address == "127.0.0.1:5555")
        })
        .await;
        let coord = worker.registry().get(&id("coord")).unwrap();
        assert_eq!(coord.node_type, NodeType::Coordinator);
    }

    let alpha = star.coord.registry().get(&id("alpha")).unwrap();
    assert_eq!(alpha.node_type, NodeType::Worker);
    assert_eq!(alpha.roles, RoleSet::from([Role::Detector, Role::Protector]));
    assert_eq!(star.coord.registry().stats().workers, 2);

    star.stop().await;
}

// =============================================================================
// Alert relay
// =============================================================================

#[tokio::test]
async fn test_detected_alert_reaches_every_node_once() {
    let star = Star::start().await;

    let alert = AlertRecord::new("port_scan", 0.92, "camera-1").with_description("SYN sweep");
    assert!(star.alpha.detector.raise(alert));

    wait_until("coordinator to log the alert", || star.coord.logger.len() == 1).await;
    wait_until("bravo to act on the alert", || {
        star.bravo.protector.handled_alerts().len() == 1
    })
    .await;
    settle().await;

    // Handled locally by the origin, never echoed back to it.
    assert_eq!(star.alpha.protector.handled_alerts().len(), 1);
    assert_eq!(star.alpha.logger.len(), 1);
    // The coordinator logs but does not protect.
    assert!(star.coord.protector.handled_alerts().is_empty());
    assert_eq!(star.bravo.protector.handled_alerts().len(), 1);

    let logged = &star.coord.logger.recent(1)[0];
    assert_eq!(logged.alert_type, "port_scan");
    assert_eq!(logged.device_id, "camera-1");
    assert!(logged.timestamp > 0.0);

    star.stop().await;
}

#[tokio::test]
async fn test_coordinator_alert_fans_out_to_workers() {
    let star = Star::start().await;

    let sent = star
        .coord
        .broadcast_alert(AlertRecord::new("ddos", 0.7, "gateway"))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    wait_until("both workers to handle the alert", || {
        star.alpha.protector.handled_alerts().len() == 1
            && star.bravo.protector.handled_alerts().len() == 1
    })
    .await;

    star.stop().await;
}

// =============================================================================
// Policy propagation
// =============================================================================

#[tokio::test]
async fn test_policy_update_is_merged_everywhere() {
    let star = Star::start().await;

    let mut first = PolicySet::new();
    first.insert("ddos", json!({"threshold": 100, "action": "block"}));
    star.coord.propagate_policy(first).await.unwrap();

    wait_until("workers to receive the first policy", || {
        star.bravo.protector.policies().get("ddos").is_some()
            && star.alpha.protector.policies().get("ddos").is_some()
    })
    .await;

    // A worker-originated update travels upstream and is relayed on.
    let mut second = PolicySet::new();
    second.insert("ddos", json!({"threshold": 50}));
    star.alpha.propagate_policy(second).await.unwrap();

    let expected = json!({"threshold": 50, "action": "block"});
    wait_until("bravo to merge the relayed policy", || {
        star.bravo.protector.policies().get("ddos") == Some(&expected)
    })
    .await;
    wait_until("coordinator to merge the policy", || {
        star.coord.policies().get("ddos") == Some(&expected)
    })
    .await;
    assert_eq!(star.alpha.policies().get("ddos"), Some(&expected));

    star.stop().await;
}

// =============================================================================
// Staleness and partitions
// =============================================================================

#[tokio::test]
async fn test_partitioned_worker_is_timed_out_and_announced_offline() {
    let star = Star::start().await;

    // Let bravo learn about alpha through a relayed status.
    star.alpha.announce_status(NodeStatus::Active).await.unwrap();
    wait_until("bravo to learn about alpha", || {
        star.bravo.registry().contains(&id("alpha"))
    })
    .await;

    star.mesh.network.partition(&id("alpha"));
    wait_until("alpha to notice it is cut off", || {
        star.alpha.status() == NodeStatus::Degraded
    })
    .await;

    // Advance in two steps so bravo's heartbeats keep it fresh.
    let heard_from_bravo_now = |star: &Star| {
        star.coord.registry().get(&id("bravo")).map(|p| p.last_seen) == Some(star.mesh.clock.now())
    };
    star.mesh.clock.advance(Duration::from_millis(200));
    wait_until("bravo heartbeat", || heard_from_bravo_now(&star)).await;
    star.mesh.clock.advance(Duration::from_millis(200));

    wait_until("coordinator to drop alpha", || {
        !star.coord.registry().contains(&id("alpha"))
    })
    .await;
    assert!(star.coord.registry().contains(&id("bravo")));
    wait_until("bravo to drop alpha", || {
        !star.bravo.registry().contains(&id("alpha"))
    })
    .await;

    // Healing brings alpha back.
    star.mesh.network.heal(&id("alpha"));
    wait_until("alpha to recover", || star.alpha.status() == NodeStatus::Active).await;
    wait_until("coordinator to re-register alpha", || {
        star.coord.registry().contains(&id("alpha"))
    })
    .await;

    star.stop().await;
}

#[tokio::test]
async fn test_stopping_worker_is_dropped_everywhere() {
    let star = Star::start().await;
    star.bravo.announce_status(NodeStatus::Active).await.unwrap();
    wait_until("alpha to learn about bravo", || {
        star.alpha.registry().contains(&id("bravo"))
    })
    .await;

    star.bravo.stop().await.unwrap();
    assert_eq!(star.bravo.status(), NodeStatus::Inactive);

    wait_until("coordinator to drop bravo", || {
        !star.coord.registry().contains(&id("bravo"))
    })
    .await;
    wait_until("alpha to drop bravo", || {
        !star.alpha.registry().contains(&id("bravo"))
    })
    .await;

    star.alpha.stop().await.unwrap();
    star.coord.stop().await.unwrap();
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn test_coordinator_changes_worker_roles() {
    let star = Star::start().await;
    assert!(star.alpha.detector.is_running());

    let result = star
        .coord
        .send_command(
            &id("alpha"),
            CHANGE_ROLE,
            params(json!({"roles": ["logger"]})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(star.alpha.roles(), RoleSet::from([Role::Logger]));
    assert!(!star.alpha.detector.is_running());
    assert!(!star.alpha.protector.is_running());

    // The detector is gone, so raising does nothing.
    assert!(!star.alpha.detector.raise(AlertRecord::new("scan", 0.5, "cam")));

    let rejected = star
        .coord
        .send_command(&id("bravo"), "self_destruct", Map::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.message, "unknown command");

    star.stop().await;
}

#[tokio::test]
async fn test_worker_updates_coordinator_config() {
    let star = Star::start().await;

    let result = star
        .alpha
        .send_command(
            &id("coord"),
            UPDATE_CONFIG,
            params(json!({"config": {"associated_devices": ["router-1"]}})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(
        star.coord.snapshot().associated_devices,
        vec!["router-1".to_string()]
    );

    star.stop().await;
}

#[tokio::test]
async fn test_restart_command_brings_worker_back() {
    let star = Star::start().await;

    let result = star
        .coord
        .send_command(&id("bravo"), RESTART, Map::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(result.success);

    wait_until("bravo to stop", || star.bravo.status() == NodeStatus::Inactive).await;
    wait_until("bravo to come back", || star.bravo.status() == NodeStatus::Active).await;
    wait_until("coordinator to see bravo again", || {
        star.coord.registry().contains(&id("bravo"))
    })
    .await;
    assert!(star.bravo.protector.is_running());

    star.stop().await;
}
