//! Shared fixtures for the delivery integration tests
#![allow(dead_code)] // Test utility module - not all helpers used in every test

pub mod mock_server;
pub mod mock_transport;

use std::{path::Path, time::Duration};

use feedcast_common::time;
use feedcast_delivery::{
    DestinationInfo, Hop, Provisioning, ProvisioningSnapshot, RedirectCache, SnapshotHandle, Timers,
};
use feedcast_spool::{PublishId, SpoolEntry, SpoolMetadata, SpoolStore};

pub const LOCAL_NODE: &str = "n1";

/// Timers matching the documented backoff scenario: 10s, doubling, 150s cap.
pub fn scenario_timers() -> Timers {
    Timers {
        init_failure_timer_ms: 10_000,
        max_failure_timer_ms: 150_000,
        backoff_multiplier: 2.0,
        ..Timers::default()
    }
}

pub fn snapshot(destinations: Vec<DestinationInfo>, timers: Timers) -> SnapshotHandle {
    SnapshotHandle::new(
        ProvisioningSnapshot::build(
            LOCAL_NODE,
            Provisioning {
                destinations,
                timers,
                ..Provisioning::default()
            },
        )
        .unwrap(),
    )
}

pub fn routed_snapshot(
    nodes: &[&str],
    hops: Vec<Hop>,
    destinations: Vec<DestinationInfo>,
) -> SnapshotHandle {
    SnapshotHandle::new(
        ProvisioningSnapshot::build(
            LOCAL_NODE,
            Provisioning {
                nodes: nodes.iter().map(ToString::to_string).collect(),
                hops,
                destinations,
                ..Provisioning::default()
            },
        )
        .unwrap(),
    )
}

pub fn redirects() -> std::sync::Arc<RedirectCache> {
    std::sync::Arc::new(RedirectCache::in_memory(Duration::from_secs(86_400)))
}

/// Deposit a file whose file id is its publish id, accepted now.
pub async fn deposit(spool: &SpoolStore, id: &str) -> SpoolEntry {
    deposit_received(spool, id, time::now_millis()).await
}

pub async fn deposit_received(spool: &SpoolStore, id: &str, received_at_ms: u64) -> SpoolEntry {
    let metadata = SpoolMetadata::new(id, "text/plain").received_at(received_at_ms);
    spool
        .deposit(&PublishId::new(id).unwrap(), &metadata, id.as_bytes())
        .await
        .unwrap()
}

/// Write an entry under an exact file name, the way another node would have.
pub fn place(dir: &Path, name: &str, publish_id: &str) {
    let metadata = SpoolMetadata::new(publish_id, "text/plain");
    std::fs::write(dir.join(name), publish_id.as_bytes()).unwrap();
    std::fs::write(dir.join(format!("{name}.M")), metadata.encode().unwrap()).unwrap();
}
