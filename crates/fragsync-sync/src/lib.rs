//! fragsync sync engine
//!
//! Detects when the merged document of an aggregation record has drifted from
//! the remote object and brings the remote side back in line, at most one
//! replica per key at a time.
//!
//! # Core Concepts
//!
//! - [`ChangeDetector`]: hash comparison, error cooldowns, periodic revalidation
//! - [`ClaimManager`]: single-flight claims written into the record itself
//! - [`RemoteExecutor`]: resumable ensure-exists / update / delete plan
//! - [`StatusReporter`]: conflict-safe status write-back
//! - [`SyncScheduler`]: event-driven, deduplicated worker pool
//! - [`Aggregator`]: all of the above behind one handle
//!
//! # Example
//!
//! ```rust
//! use fragsync_model::{ExternalResourceKey, ResourceType, SourceRef, SyncPhase};
//! use fragsync_store::InMemoryRecordStore;
//! use fragsync_sync::sim::SimulatedRemote;
//! use fragsync_sync::{Aggregator, CycleOutcome, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let aggregator = Aggregator::new(
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(SimulatedRemote::reliable()),
//!     SyncConfig::default(),
//! )
//! .unwrap();
//!
//! let key = ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tunnel-1");
//! aggregator
//!     .producer(SourceRef::new("Ingress", "default", "web"))
//!     .contribute_fragment(&key, json!({"ingress": [{"hostname": "a.example.com"}]}), 10)
//!     .await
//!     .unwrap();
//!
//! assert_eq!(aggregator.sync_once(&key).await.unwrap(), CycleOutcome::Synced);
//! assert_eq!(aggregator.sync_once(&key).await.unwrap(), CycleOutcome::UpToDate);
//! let status = aggregator.status(&key).await.unwrap().unwrap();
//! assert_eq!(status.phase, SyncPhase::Synced);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod aggregator;
mod claim;
mod config;
mod detector;
mod error;
mod executor;
mod remote;
mod reporter;
mod scheduler;

pub mod sim;
pub mod telemetry;

pub use aggregator::Aggregator;
pub use claim::ClaimManager;
pub use config::{ConfigError, ConflictRetryConfig, RemoteRetryConfig, SyncConfig};
pub use detector::{ChangeDetector, SyncDecision, SyncReason};
pub use error::SyncError;
pub use executor::{ApplyOutcome, Checkpoint, PlanStep, RemoteExecutor};
pub use remote::{RemoteClient, RemoteError, RemoteErrorKind};
pub use reporter::{AttemptedMerge, StatusReporter, TeardownOutcome};
pub use scheduler::{
    allowed_transitions, validate_transition, CycleOutcome, KeyState, KeyTracker,
    SchedulerHandle, SyncScheduler, SyncWorker,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
