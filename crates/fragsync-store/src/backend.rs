//! Persistence interface
//!
//! Any substrate with compare-and-swap semantics can back the aggregator: a
//! versioned document store, a table with a version column, an actor owning
//! the records. [`RecordStore`] is the whole contract.

use crate::error::StoreError;
use async_trait::async_trait;
use fragsync_model::{AggregationRecord, ExternalResourceKey, RevisionToken, Versioned};
use tokio::sync::broadcast;

/// Change notification emitted after every successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Record created or replaced
    Written {
        /// Record key
        key: ExternalResourceKey,
        /// Revision after the write
        revision: RevisionToken,
    },
    /// Record deleted
    Deleted {
        /// Record key
        key: ExternalResourceKey,
    },
}

impl StoreEvent {
    /// Key the event concerns
    #[inline]
    #[must_use]
    pub fn key(&self) -> &ExternalResourceKey {
        match self {
            Self::Written { key, .. } | Self::Deleted { key } => key,
        }
    }
}

/// Versioned record storage with conditional writes
///
/// # Contract
/// - Every successful write produces a new, strictly greater revision.
/// - The stored copy carries its own revision in `status.revision`.
/// - `subscribe` receivers see one [`StoreEvent`] per successful write or
///   delete. Slow receivers may observe `Lagged` and must re-list.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Current record and its revision
    async fn get(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<Option<Versioned<AggregationRecord>>, StoreError>;

    /// Write `record` if the stored revision still equals `expected`
    ///
    /// `expected: None` means create-if-absent.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if the stored revision moved on
    async fn conditional_write(
        &self,
        key: &ExternalResourceKey,
        record: AggregationRecord,
        expected: Option<RevisionToken>,
    ) -> Result<RevisionToken, StoreError>;

    /// Delete the record if the stored revision still equals `expected`
    ///
    /// # Errors
    /// [`StoreError::Conflict`] if the stored revision moved on or the
    /// record is gone
    async fn conditional_delete(
        &self,
        key: &ExternalResourceKey,
        expected: RevisionToken,
    ) -> Result<(), StoreError>;

    /// Keys of all stored records
    async fn list_keys(&self) -> Result<Vec<ExternalResourceKey>, StoreError>;

    /// Subscribe to write notifications
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
