//! fragsync record store
//!
//! Versioned persistence for aggregation records and the producer-facing
//! ConfigSource store built on it.
//!
//! # Core Concepts
//!
//! - [`RecordStore`]: compare-and-swap persistence contract
//! - [`InMemoryRecordStore`]: `DashMap`-backed implementation
//! - [`update_record`]: bounded read-modify-write loop with jittered backoff
//! - [`FragmentStore`] / [`ProducerHandle`]: fragment upsert and withdrawal
//!
//! # Example
//!
//! ```rust
//! use fragsync_model::{ExternalResourceKey, ResourceType, SourceRef};
//! use fragsync_store::{FragmentStore, InMemoryRecordStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = FragmentStore::new(Arc::new(InMemoryRecordStore::new()));
//! let key = ExternalResourceKey::new(ResourceType::DnsRecords, "acct", "example.com");
//! let producer = store.producer(SourceRef::new("DNSSource", "default", "web"));
//!
//! producer
//!     .contribute_fragment(&key, json!({"records": [{"name": "www", "type": "A"}]}), 10)
//!     .await
//!     .unwrap();
//! assert_eq!(store.get(&key).await.unwrap().unwrap().value.fragments().len(), 1);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod backend;
mod error;
mod fragments;
mod memory;
mod retry;

pub use backend::{RecordStore, StoreEvent};
pub use error::StoreError;
pub use fragments::{FragmentStore, ProducerHandle};
pub use memory::{InMemoryRecordStore, DEFAULT_EVENT_CAPACITY};
pub use retry::{update_record, Applied, ConflictRetryPolicy, Mutation};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
