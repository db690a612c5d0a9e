//! Mesh fixture shared by the flow tests.

use std::sync::{Arc, Once};
use std::time::Duration;

use mesh_coordination::{
    ManualDetector, ManualTimeSource, MemoryNetwork, NodeConfig, RecordingProtectionEngine,
    RoleSet, SecurityNode, Timestamp, TimingConfig, TracingAlertLogger,
};

pub const WAIT: Duration = Duration::from_secs(3);
pub const COORDINATOR_ADDRESS: &str = "127.0.0.1:5555";

static TRACING: Once = Once::new();

/// Honour `RUST_LOG` when debugging a failing flow.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One node plus the collaborators it was built with.
pub struct TestNode {
    pub node: SecurityNode,
    pub logger: Arc<TracingAlertLogger>,
    pub protector: Arc<RecordingProtectionEngine>,
    pub detector: Arc<ManualDetector>,
}

impl std::ops::Deref for TestNode {
    type Target = SecurityNode;

    fn deref(&self) -> &SecurityNode {
        &self.node
    }
}

/// In-memory hub and a clock shared by every node in the test.
pub struct Mesh {
    pub network: MemoryNetwork,
    pub clock: Arc<ManualTimeSource>,
}

impl Mesh {
    pub fn new() -> Self {
        init_tracing();
        Self {
            network: MemoryNetwork::new(),
            clock: Arc::new(ManualTimeSource::new(Timestamp::from_millis(1_700_000_000_000))),
        }
    }

    pub fn node(&self, config: NodeConfig) -> TestNode {
        let logger = Arc::new(TracingAlertLogger::default());
        let protector = Arc::new(RecordingProtectionEngine::new());
        let detector = Arc::new(ManualDetector::new());
        let node = SecurityNode::builder(config.with_timing(TimingConfig::for_testing()))
            .transport(Arc::new(self.network.clone()))
            .time_source(self.clock.clone())
            .alert_logger(logger.clone())
            .protection_engine(protector.clone())
            .detector(detector.clone())
            .build()
            .unwrap();
        TestNode {
            node,
            logger,
            protector,
            detector,
        }
    }

    pub fn coordinator(&self, id: &str, roles: RoleSet) -> TestNode {
        self.node(NodeConfig::coordinator().with_node_id(id).with_roles(roles))
    }

    pub fn worker(&self, id: &str, roles: RoleSet) -> TestNode {
        self.node(
            NodeConfig::worker(COORDINATOR_ADDRESS)
                .with_node_id(id)
                .with_roles(roles),
        )
    }
}

/// Poll `condition` every few milliseconds, failing the test after `WAIT`.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight frames time to land before asserting on absence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
