//! In-memory compare-and-swap store
//!
//! [`InMemoryRecordStore`] keeps records in a [`DashMap`]; each conditional
//! write checks and bumps the revision while holding the shard entry, so
//! check-and-set is atomic per key.

use crate::backend::{RecordStore, StoreEvent};
use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fragsync_model::{AggregationRecord, ExternalResourceKey, RevisionToken, Versioned};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default event channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Thread-safe in-memory record store
#[derive(Debug)]
pub struct InMemoryRecordStore {
    records: DashMap<ExternalResourceKey, Versioned<AggregationRecord>>,
    next_revision: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryRecordStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create empty store with a custom event buffer
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            records: DashMap::new(),
            next_revision: AtomicU64::new(1),
            events,
        }
    }

    /// Number of stored records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn bump(&self) -> RevisionToken {
        RevisionToken(self.next_revision.fetch_add(1, Ordering::SeqCst))
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<Option<Versioned<AggregationRecord>>, StoreError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn conditional_write(
        &self,
        key: &ExternalResourceKey,
        mut record: AggregationRecord,
        expected: Option<RevisionToken>,
    ) -> Result<RevisionToken, StoreError> {
        if &record.key != key {
            return Err(StoreError::KeyMismatch {
                key: key.to_string(),
                record: record.key.to_string(),
            });
        }

        let revision = match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().revision;
                if expected != Some(actual) {
                    return Err(StoreError::conflict(key, expected, Some(actual)));
                }
                let revision = self.bump();
                record.status.revision = Some(revision);
                entry.insert(Versioned {
                    value: record,
                    revision,
                });
                revision
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Err(StoreError::conflict(key, expected, None));
                }
                let revision = self.bump();
                record.status.revision = Some(revision);
                entry.insert(Versioned {
                    value: record,
                    revision,
                });
                revision
            }
        };

        tracing::trace!(key = %key, %revision, "record written");
        self.publish(StoreEvent::Written {
            key: key.clone(),
            revision,
        });
        Ok(revision)
    }

    async fn conditional_delete(
        &self,
        key: &ExternalResourceKey,
        expected: RevisionToken,
    ) -> Result<(), StoreError> {
        let removed = self
            .records
            .remove_if(key, |_, current| current.revision == expected);

        if removed.is_none() {
            let actual = self.records.get(key).map(|entry| entry.revision);
            return Err(StoreError::conflict(key, Some(expected), actual));
        }

        tracing::trace!(key = %key, "record deleted");
        self.publish(StoreEvent::Deleted { key: key.clone() });
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<ExternalResourceKey>, StoreError> {
        let mut keys: Vec<_> = self.records.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
