//! Store wrapper that loses write races on purpose

use async_trait::async_trait;
use fragsync_model::{AggregationRecord, ExternalResourceKey, RevisionToken, Versioned};
use fragsync_store::{InMemoryRecordStore, RecordStore, StoreError, StoreEvent};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Wraps [`InMemoryRecordStore`] and fails a share of conditional writes
///
/// An injected conflict first rewrites the current record unchanged, so the
/// revision really moves on, as if another writer got there first.
#[derive(Debug)]
pub struct ContendedStore {
    inner: Arc<InMemoryRecordStore>,
    rng: Mutex<StdRng>,
    conflict_rate: f64,
    injected: AtomicU64,
}

impl ContendedStore {
    pub fn new(inner: Arc<InMemoryRecordStore>, conflict_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            conflict_rate,
            injected: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryRecordStore> {
        &self.inner
    }

    /// Conflicts injected so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn roll(&self) -> bool {
        self.rng.lock().gen::<f64>() < self.conflict_rate
    }
}

#[async_trait]
impl RecordStore for ContendedStore {
    async fn get(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<Option<Versioned<AggregationRecord>>, StoreError> {
        self.inner.get(key).await
    }

    async fn conditional_write(
        &self,
        key: &ExternalResourceKey,
        record: AggregationRecord,
        expected: Option<RevisionToken>,
    ) -> Result<RevisionToken, StoreError> {
        if expected.is_some() && self.roll() {
            if let Some(current) = self.inner.get(key).await? {
                let bumped = self
                    .inner
                    .conditional_write(key, current.value, Some(current.revision))
                    .await?;
                self.injected.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::conflict(key, expected, Some(bumped)));
            }
        }
        self.inner.conditional_write(key, record, expected).await
    }

    async fn conditional_delete(
        &self,
        key: &ExternalResourceKey,
        expected: RevisionToken,
    ) -> Result<(), StoreError> {
        self.inner.conditional_delete(key, expected).await
    }

    async fn list_keys(&self) -> Result<Vec<ExternalResourceKey>, StoreError> {
        self.inner.list_keys().await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}
