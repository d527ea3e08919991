//! fragsync merge engine
//!
//! Deterministic merge of many producers' fragments into one document.
//!
//! # Core Concepts
//!
//! - [`MergeEngine`]: sorts fragments by (priority, source) and walks the schema
//! - [`MergeSchema`] / [`FieldRule`]: how each field combines
//! - [`FieldStrategy`]: per-rule conflict resolution
//!   ([`ScalarStrategy`], [`KeyedListStrategy`], [`SetListStrategy`])
//! - [`Provenance`]: which producer won each field path
//! - [`SchemaRegistry`]: schema per resource type
//!
//! # Example
//!
//! ```rust
//! use fragsync_merge::MergeEngine;
//! use fragsync_model::{ConfigFragment, ResourceType, SourceRef};
//! use serde_json::json;
//!
//! let engine = MergeEngine::with_defaults();
//! let fragments = [
//!     ConfigFragment::new(
//!         SourceRef::new("Tunnel", "default", "a"),
//!         json!({"ingress": [{"hostname": "a.example.com", "service": "http://x"}]}),
//!         10,
//!     ),
//!     ConfigFragment::new(
//!         SourceRef::new("Tunnel", "default", "b"),
//!         json!({"ingress": [{"hostname": "a.example.com", "service": "http://y"}]}),
//!         5,
//!     ),
//! ];
//! let outcome = engine.merge(&ResourceType::TunnelConfig, &fragments).unwrap();
//! assert_eq!(
//!     outcome.document.as_value()["ingress"][0]["service"],
//!     json!("http://y")
//! );
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod engine;
mod keyed_list;
mod registry;
mod scalar;
mod schema;
mod set_list;
mod strategy;

pub use engine::{merge_with_schema, MergeEngine, MergeOutcome, MergedDocument};
pub use keyed_list::KeyedListStrategy;
pub use registry::SchemaRegistry;
pub use scalar::ScalarStrategy;
pub use schema::{FieldRule, MergeSchema};
pub use set_list::SetListStrategy;
pub use strategy::{Contribution, FieldStrategy, MergeError, Provenance};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
