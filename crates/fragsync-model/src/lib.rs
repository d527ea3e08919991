//! fragsync data model
//!
//! Plain data shared by every fragsync crate.
//!
//! # Core Concepts
//!
//! - [`ExternalResourceKey`]: identity of one remote object
//! - [`ConfigFragment`]: one producer's contribution, owned by its [`SourceRef`]
//! - [`AggregationRecord`]: persisted container of fragments + [`SyncStatus`]
//! - [`ContentHash`]: SHA-256 over [`canonical_json`]
//!
//! # Example
//!
//! ```rust
//! use fragsync_model::{
//!     AggregationRecord, ConfigFragment, ExternalResourceKey, ResourceType, SourceRef,
//! };
//! use serde_json::json;
//!
//! let key = ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tunnel-1");
//! let mut record = AggregationRecord::new(key);
//! record.upsert_fragment(ConfigFragment::new(
//!     SourceRef::new("Tunnel", "default", "edge"),
//!     json!({"ingress": [{"hostname": "a.example.com", "service": "http://web"}]}),
//!     10,
//! ));
//! assert_eq!(record.fragments().len(), 1);
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod fragment;
mod hash;
mod key;
mod record;
mod status;

pub use fragment::{ConfigFragment, FragmentError, SourceRef};
pub use hash::{canonical_json, ContentHash, HashError};
pub use key::{ExternalResourceKey, ResourceType};
pub use record::{
    AggregationRecord, CredentialsRef, RevisionToken, SyncClaim, UpsertEffect, Versioned,
};
pub use status::{result_keys, ErrorClass, ResultData, SyncPhase, SyncStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
