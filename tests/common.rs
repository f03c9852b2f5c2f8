//! Shared fixtures for the integration tests
//!
//! Nodes are started on in-memory stores unless a test needs sled. Several
//! nodes of one test share a single store, the way the nodes of a cluster
//! share their database.

#![allow(dead_code)]

use entity_security::{
    ActivityId, EntityId, IdentityId, InProcessMessageBus, MemoryDataProvider,
    NullMessageProvider, SecurityConfig, SecurityDataProvider, SecuritySystem,
};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn test_config() -> SecurityConfig {
    entity_security::logging::init_test_logging();
    SecurityConfig::default()
}

/// A single node on a fresh in-memory store
pub async fn single_node() -> (SecuritySystem, Arc<MemoryDataProvider>) {
    let data = Arc::new(MemoryDataProvider::new());
    let system = start_single(test_config(), data.clone()).await;
    (system, data)
}

pub async fn start_single(config: SecurityConfig, data: Arc<MemoryDataProvider>) -> SecuritySystem {
    SecuritySystem::start(config, data, Arc::new(NullMessageProvider::new("solo")))
        .await
        .expect("node should start")
}

/// Start a node connected to `bus` on the shared `data` store
pub async fn bus_node(
    bus: &Arc<InProcessMessageBus>,
    node_id: &str,
    data: Arc<dyn SecurityDataProvider>,
) -> SecuritySystem {
    bus_node_with(bus, node_id, data, test_config()).await
}

pub async fn bus_node_with(
    bus: &Arc<InProcessMessageBus>,
    node_id: &str,
    data: Arc<dyn SecurityDataProvider>,
    config: SecurityConfig,
) -> SecuritySystem {
    let messaging = Arc::new(bus.connect(node_id).await);
    SecuritySystem::start(config, data, messaging)
        .await
        .expect("node should start")
}

/// Create entities from `(id, parent, owner)` triples in order
pub async fn create_tree(system: &SecuritySystem, entities: &[(EntityId, EntityId, IdentityId)]) {
    for (id, parent, owner) in entities {
        system
            .create_entity(*id, *parent, *owner)
            .await
            .expect("entity should be created");
    }
}

/// Poll until `condition` holds or the wait limit passes
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until `system` has executed everything up to `id`
pub async fn wait_for_activity(system: &SecuritySystem, id: ActivityId) -> bool {
    wait_until(|| {
        system
            .completion_state()
            .map(|state| state.last_activity_id >= id && state.gaps.is_empty())
            .unwrap_or(false)
    })
    .await
}
