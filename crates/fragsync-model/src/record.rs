//! Aggregation record
//!
//! The persisted, versioned container holding every fragment and the sync
//! status for one external resource.

use crate::fragment::{ConfigFragment, SourceRef};
use crate::key::ExternalResourceKey;
use crate::status::SyncStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Optimistic-concurrency token of a persisted record
///
/// Changes on every successful write. Writers pass the token they read;
/// the store rejects the write if it no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionToken(pub u64);

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A value together with the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The stored value
    pub value: T,
    /// Revision the value was read at
    pub revision: RevisionToken,
}

/// How to authenticate to the remote API for this resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsRef {
    /// Namespace of the secret
    pub namespace: String,
    /// Name of the secret
    pub name: String,
    /// Key inside the secret, if not the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl CredentialsRef {
    /// Reference the default key of a secret
    #[inline]
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key: None,
        }
    }
}

/// Advisory single-flight marker
///
/// Held by at most one scheduler replica. Leases expire so a crashed holder
/// cannot pin a key forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncClaim {
    /// Replica identity
    pub holder: String,
    /// When the claim was won
    pub acquired_at: DateTime<Utc>,
    /// When other replicas may take the claim over
    pub expires_at: DateTime<Utc>,
}

impl SyncClaim {
    /// True once the lease has run out
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Effect of inserting a fragment into a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertEffect {
    /// No fragment from this source existed
    Inserted,
    /// A fragment from this source was replaced
    Replaced,
    /// Payload and priority were identical; nothing changed
    Unchanged,
}

/// One record per external resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRecord {
    /// Resource identity
    pub key: ExternalResourceKey,
    /// Fragments, unique by source and kept sorted by it
    fragments: Vec<ConfigFragment>,
    /// Remote API credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsRef>,
    /// Sync outcome
    #[serde(default)]
    pub status: SyncStatus,
    /// Single-flight claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<SyncClaim>,
    /// Last fragment was withdrawn; the remote object must be deleted
    #[serde(default)]
    pub teardown_requested: bool,
    /// Manual re-sync requested by an operator
    #[serde(default)]
    pub resync_requested: bool,
}

impl AggregationRecord {
    /// Create an empty record
    #[must_use]
    pub fn new(key: ExternalResourceKey) -> Self {
        Self {
            key,
            fragments: Vec::new(),
            credentials: None,
            status: SyncStatus::default(),
            claim: None,
            teardown_requested: false,
            resync_requested: false,
        }
    }

    /// All fragments, sorted by source
    #[inline]
    #[must_use]
    pub fn fragments(&self) -> &[ConfigFragment] {
        &self.fragments
    }

    /// Fragment contributed by `source`, if any
    #[must_use]
    pub fn fragment(&self, source: &SourceRef) -> Option<&ConfigFragment> {
        self.position(source).ok().map(|idx| &self.fragments[idx])
    }

    /// True if no producer currently contributes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Insert or replace the fragment from `fragment.source`
    ///
    /// A content-identical replacement leaves the record untouched.
    pub fn upsert_fragment(&mut self, fragment: ConfigFragment) -> UpsertEffect {
        match self.position(&fragment.source) {
            Ok(idx) if self.fragments[idx].same_content(&fragment) => UpsertEffect::Unchanged,
            Ok(idx) => {
                self.fragments[idx] = fragment;
                UpsertEffect::Replaced
            }
            Err(idx) => {
                self.fragments.insert(idx, fragment);
                UpsertEffect::Inserted
            }
        }
    }

    /// Remove the fragment from `source`, returning it if present
    pub fn remove_fragment(&mut self, source: &SourceRef) -> Option<ConfigFragment> {
        self.position(source)
            .ok()
            .map(|idx| self.fragments.remove(idx))
    }

    /// True if `holder` owns a live claim
    #[must_use]
    pub fn is_claimed_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.claim
            .as_ref()
            .is_some_and(|c| c.holder == holder && !c.is_expired(now))
    }

    /// True if some replica owns a live claim
    #[must_use]
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| !c.is_expired(now))
    }

    fn position(&self, source: &SourceRef) -> Result<usize, usize> {
        self.fragments.binary_search_by(|f| f.source.cmp(source))
    }
}
