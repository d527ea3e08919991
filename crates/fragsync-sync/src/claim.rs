//! Single-flight claims
//!
//! A claim is a field of the aggregation record, so acquiring it is one more
//! conditional write. Losing the race is a no-op for the loser.

use crate::error::SyncError;
use chrono::{DateTime, Duration, Utc};
use fragsync_model::{AggregationRecord, ExternalResourceKey, SyncClaim, SyncPhase, Versioned};
use fragsync_store::{update_record, ConflictRetryPolicy, Mutation, RecordStore, StoreError};
use std::sync::Arc;

/// Acquires and releases sync claims for one replica
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn RecordStore>,
    policy: ConflictRetryPolicy,
    holder: String,
    lease: Duration,
}

impl std::fmt::Debug for ClaimManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimManager")
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl ClaimManager {
    /// Create claim manager for `holder`
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        policy: ConflictRetryPolicy,
        holder: impl Into<String>,
        lease: std::time::Duration,
    ) -> Self {
        Self {
            store,
            policy,
            holder: holder.into(),
            lease: Duration::from_std(lease).unwrap_or_else(|_| Duration::seconds(120)),
        }
    }

    /// Replica identity written into claims
    #[inline]
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Claim lease
    #[inline]
    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Claim `current` at exactly the revision it was read at
    ///
    /// Returns the claimed record, or `None` if another replica holds a live
    /// claim or the record changed since it was read. Either way the caller
    /// skips this cycle; the next write re-triggers evaluation.
    ///
    /// Winning moves the status to [`SyncPhase::Syncing`] and consumes a
    /// pending resync request.
    ///
    /// # Errors
    /// Non-conflict store failures
    pub async fn try_claim(
        &self,
        current: Versioned<AggregationRecord>,
        now: DateTime<Utc>,
    ) -> Result<Option<Versioned<AggregationRecord>>, SyncError> {
        let Versioned {
            value: mut record,
            revision,
        } = current;
        let key = record.key.clone();

        if let Some(claim) = record.claim.as_ref() {
            if claim.holder != self.holder && !claim.is_expired(now) {
                tracing::debug!(key = %key, holder = %claim.holder, "claim held elsewhere");
                return Ok(None);
            }
            if claim.holder != self.holder {
                tracing::info!(key = %key, previous = %claim.holder, "taking over expired claim");
            }
        }

        record.claim = Some(self.claim_at(now));
        record.status.phase = SyncPhase::Syncing;
        record.resync_requested = false;

        match self
            .store
            .conditional_write(&key, record.clone(), Some(revision))
            .await
        {
            Ok(claimed) => {
                record.status.revision = Some(claimed);
                tracing::debug!(key = %key, holder = %self.holder, revision = %claimed, "claim won");
                Ok(Some(Versioned {
                    value: record,
                    revision: claimed,
                }))
            }
            Err(StoreError::Conflict { .. }) => {
                metrics::counter!("fragsync_write_conflicts_total").increment(1);
                tracing::debug!(key = %key, "claim race lost");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drop our claim if we still hold it
    ///
    /// # Errors
    /// Store failures other than a missing record
    pub async fn release(&self, key: &ExternalResourceKey) -> Result<(), SyncError> {
        let holder = self.holder.as_str();
        update_record(
            self.store.as_ref(),
            key,
            &self.policy,
            |current| -> Result<_, SyncError> {
                let Some(mut record) = current else {
                    return Ok(Mutation::Skip(()));
                };
                if record.claim.as_ref().map(|c| c.holder.as_str()) != Some(holder) {
                    return Ok(Mutation::Skip(()));
                }
                record.claim = None;
                if record.status.phase == SyncPhase::Syncing {
                    record.status.phase = SyncPhase::Pending;
                }
                Ok(Mutation::Write(record, ()))
            },
        )
        .await?;
        Ok(())
    }

    /// A fresh claim for this replica
    #[must_use]
    pub fn claim_at(&self, now: DateTime<Utc>) -> SyncClaim {
        SyncClaim {
            holder: self.holder.clone(),
            acquired_at: now,
            expires_at: now + self.lease,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragsync_model::ResourceType;
    use fragsync_store::InMemoryRecordStore;

    fn key() -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tun")
    }

    async fn seeded() -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        store
            .conditional_write(&key(), AggregationRecord::new(key()), None)
            .await
            .unwrap();
        store
    }

    fn manager(store: &Arc<InMemoryRecordStore>, holder: &str) -> ClaimManager {
        ClaimManager::new(
            store.clone(),
            ConflictRetryPolicy::default(),
            holder,
            std::time::Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn only_one_replica_wins() {
        let store = seeded().await;
        let snapshot = store.get(&key()).await.unwrap().unwrap();
        let now = Utc::now();

        let a = manager(&store, "replica-a")
            .try_claim(snapshot.clone(), now)
            .await
            .unwrap();
        let b = manager(&store, "replica-b")
            .try_claim(snapshot, now)
            .await
            .unwrap();

        let claimed = a.unwrap();
        assert!(b.is_none());
        assert_eq!(claimed.value.status.phase, SyncPhase::Syncing);
        assert!(claimed.value.is_claimed_by("replica-a", now));
        assert_eq!(
            store.get(&key()).await.unwrap().unwrap().revision,
            claimed.revision
        );
    }

    #[tokio::test]
    async fn live_claim_blocks_fresh_read() {
        let store = seeded().await;
        let now = Utc::now();
        let snapshot = store.get(&key()).await.unwrap().unwrap();
        manager(&store, "replica-a")
            .try_claim(snapshot, now)
            .await
            .unwrap()
            .unwrap();

        let fresh = store.get(&key()).await.unwrap().unwrap();
        assert!(manager(&store, "replica-b")
            .try_claim(fresh, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_claim_is_taken_over() {
        let store = seeded().await;
        let now = Utc::now();
        let snapshot = store.get(&key()).await.unwrap().unwrap();
        manager(&store, "replica-a")
            .try_claim(snapshot, now)
            .await
            .unwrap()
            .unwrap();

        let later = now + Duration::seconds(31);
        let fresh = store.get(&key()).await.unwrap().unwrap();
        let taken = manager(&store, "replica-b")
            .try_claim(fresh, later)
            .await
            .unwrap()
            .unwrap();
        assert!(taken.value.is_claimed_by("replica-b", later));
    }

    #[tokio::test]
    async fn release_clears_own_claim_only() {
        let store = seeded().await;
        let now = Utc::now();
        let snapshot = store.get(&key()).await.unwrap().unwrap();
        let a = manager(&store, "replica-a");
        a.try_claim(snapshot, now).await.unwrap().unwrap();

        manager(&store, "replica-b").release(&key()).await.unwrap();
        assert!(store.get(&key()).await.unwrap().unwrap().value.claim.is_some());

        a.release(&key()).await.unwrap();
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(record.claim.is_none());
        assert_eq!(record.status.phase, SyncPhase::Pending);
    }
}
