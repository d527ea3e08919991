//! Synchronization status sub-record
//!
//! Written back after every sync attempt. Everything here is plain data so an
//! operator can read it without decoding the remote API's own state.

use crate::hash::ContentHash;
use crate::record::RevisionToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Intermediate remote identifiers, keyed by step output name
pub type ResultData = BTreeMap<String, String>;

/// Well-known [`ResultData`] keys
pub mod result_keys {
    /// Identifier of the remote object, written by the ensure-exists step
    pub const REMOTE_ID: &str = "remote_id";
    /// Remote-side configuration version, written by the update step
    pub const CONFIG_VERSION: &str = "config_version";
}

/// Lifecycle phase of the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SyncPhase {
    /// Never synced, or changed since the last sync
    #[default]
    Pending,
    /// A replica holds the claim and is talking to the remote API
    Syncing,
    /// Remote state matches `config_hash`
    Synced,
    /// Last attempt failed, see `last_error`
    Error,
}

/// Failure classification recorded with `last_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorClass {
    /// Retries exhausted on timeouts, rate limits or 5xx
    Transient,
    /// Rejected by the remote API, needs a fragment fix or an operator
    Permanent,
    /// Lost optimistic-concurrency races until retries ran out
    Conflict,
}

/// Observable sync state of one aggregation record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current phase
    pub phase: SyncPhase,
    /// Completion time of the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Remote version/generation after the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    /// Hash of the last successfully synced merged document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<ContentHash>,
    /// Last computed merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_config: Option<JsonValue>,
    /// Which producer set each field of `aggregated_config`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provenance: BTreeMap<String, String>,
    /// Last failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Hash of the document the last failed attempt tried to sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_hash: Option<ContentHash>,
    /// Classification of `last_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Consecutive failed cycles
    #[serde(default)]
    pub attempts: u32,
    /// Earliest time the scheduler re-queues after a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Checkpointed identifiers from completed remote steps
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result_data: ResultData,
    /// Revision of the persisted record as of this status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionToken>,
}

impl SyncStatus {
    /// Checkpointed remote object id, if the ensure-exists step completed
    #[inline]
    #[must_use]
    pub fn remote_id(&self) -> Option<&str> {
        self.result_data
            .get(result_keys::REMOTE_ID)
            .map(String::as_str)
    }

    /// True if the last attempt ended in [`SyncPhase::Error`]
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.phase == SyncPhase::Error
    }
}
