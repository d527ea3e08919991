//! Testing utilities for the fragsync workspace
//!
//! Shared fixtures plus fake remote clients and stores for integration
//! tests.

#![allow(missing_docs)]

mod contended;
mod slow;
mod spy;

pub use contended::ContendedStore;
pub use slow::SlowRemote;
pub use spy::{RemoteCall, RemoteOp, SpyRemote};

use fragsync_model::{ExternalResourceKey, ResourceType, SourceRef};
use fragsync_sync::{ConflictRetryConfig, RemoteRetryConfig, SyncConfig};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

pub fn tunnel_key(name: &str) -> ExternalResourceKey {
    ExternalResourceKey::new(ResourceType::TunnelConfig, "test-account", name)
}

pub fn dns_key(zone: &str) -> ExternalResourceKey {
    ExternalResourceKey::new(ResourceType::DnsRecords, "test-account", zone).with_zone(zone)
}

pub fn source(kind: &str, name: &str) -> SourceRef {
    SourceRef::new(kind, "default", name)
}

pub fn ingress_payload(hostname: &str, service: &str) -> JsonValue {
    json!({
        "ingress": [{ "hostname": hostname, "service": service }],
    })
}

/// Configuration with millisecond retries and no cooldowns
pub fn fast_config(replica_id: &str) -> SyncConfig {
    SyncConfig::default()
        .with_replica_id(replica_id)
        .with_workers(4)
        .with_claim_lease(Duration::from_secs(30))
        .with_revalidation_tick(Duration::from_millis(50))
        .with_cooldowns(Duration::ZERO, Duration::ZERO)
        .with_remote(
            RemoteRetryConfig::default()
                .with_max_attempts(3)
                .with_intervals(Duration::from_millis(1), Duration::from_millis(5))
                .with_call_timeout(Duration::from_secs(5)),
        )
        .with_conflict(ConflictRetryConfig {
            max_attempts: 32,
            base_delay_ms: 1,
            max_delay_ms: 10,
        })
}
