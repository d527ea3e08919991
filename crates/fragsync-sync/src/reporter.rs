//! Status reporter
//!
//! Writes sync outcomes back into the aggregation record through the same
//! conditional-write loop producers use, so a status write never clobbers a
//! concurrent fragment change. Every write first checks that this replica
//! still holds the claim.

use crate::error::SyncError;
use crate::executor::Checkpoint;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fragsync_model::{
    result_keys, AggregationRecord, ContentHash, ErrorClass, ExternalResourceKey, SyncPhase,
};
use fragsync_store::{update_record, ConflictRetryPolicy, Mutation, RecordStore};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The merge a sync attempt worked from
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptedMerge {
    /// Canonical hash
    pub hash: ContentHash,
    /// Merged document
    pub document: JsonValue,
    /// Field path -> producer
    pub provenance: BTreeMap<String, String>,
}

/// Outcome of [`StatusReporter::mark_torn_down`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Record deleted
    Deleted,
    /// A producer contributed again during teardown; record reset to pending
    Revived,
}

/// Writes sync status for one replica
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn RecordStore>,
    policy: ConflictRetryPolicy,
    holder: String,
    lease: Duration,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl StatusReporter {
    /// Create reporter writing as `holder`
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

    /// Checkpoint one step output and renew the claim lease
    ///
    /// `None` clears the entry.
    ///
    /// # Errors
    /// [`SyncError::ClaimLost`] if another replica took over
    pub async fn record_step(
        &self,
        key: &ExternalResourceKey,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), SyncError> {
        self.write(key, |record, now| {
            match value {
                Some(value) => {
                    record
                        .status
                        .result_data
                        .insert(name.to_string(), value.to_string());
                }
                None => {
                    record.status.result_data.remove(name);
                }
            }
            if let Some(claim) = record.claim.as_mut() {
                claim.expires_at = now + self.lease;
            }
        })
        .await?;
        tracing::debug!(key = %key, step = name, value, "step checkpointed");
        Ok(())
    }

    /// Push the claim's expiry one lease into the future
    ///
    /// # Errors
    /// [`SyncError::ClaimLost`] if the claim lapsed or another replica took over
    pub async fn renew_claim(&self, key: &ExternalResourceKey) -> Result<(), SyncError> {
        self.write(key, |record, now| {
            if let Some(claim) = record.claim.as_mut() {
                claim.expires_at = now + self.lease;
            }
        })
        .await
    }

    /// Renew the claim every third of a lease until a renewal fails
    ///
    /// Never returns while renewals succeed; race it against the work the
    /// claim protects. The returned error is the failed renewal.
    pub async fn hold_claim(&self, key: &ExternalResourceKey) -> SyncError {
        let period = (self.lease / 3)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1))
            .max(std::time::Duration::from_millis(10));
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = self.renew_claim(key).await {
                return err;
            }
            tracing::trace!(key = %key, holder = %self.holder, "claim renewed");
        }
    }

    /// Record a fully successful sync and release the claim
    ///
    /// # Errors
    /// [`SyncError::ClaimLost`] if another replica took over
    pub async fn mark_synced(
        &self,
        key: &ExternalResourceKey,
        merge: &AttemptedMerge,
        config_version: Option<String>,
    ) -> Result<(), SyncError> {
        self.write(key, |record, now| {
            let status = &mut record.status;
            status.phase = SyncPhase::Synced;
            status.last_sync_time = Some(now);
            status.config_hash = Some(merge.hash);
            status.config_version = config_version
                .clone()
                .or_else(|| status.result_data.get(result_keys::CONFIG_VERSION).cloned());
            status.aggregated_config = Some(merge.document.clone());
            status.provenance = merge.provenance.clone();
            status.last_error = None;
            status.error_class = None;
            status.attempted_hash = None;
            status.attempts = 0;
            status.next_retry_at = None;
            record.claim = None;
        })
        .await?;
        tracing::info!(key = %key, hash = %merge.hash.short(), "synced");
        Ok(())
    }

    /// Record a failed attempt and release the claim
    ///
    /// `ConfigHash` is left untouched so the next pass still sees the record
    /// as dirty. Returns when the scheduler may retry.
    ///
    /// # Errors
    /// [`SyncError::ClaimLost`] if another replica took over
    pub async fn mark_failed(
        &self,
        key: &ExternalResourceKey,
        error: &SyncError,
        attempted: Option<&AttemptedMerge>,
        cooldown: std::time::Duration,
    ) -> Result<DateTime<Utc>, SyncError> {
        let class = error.class();
        let message = error.to_string();
        let cooldown = Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(30));
        let mut retry_at = Utc::now() + cooldown;

        self.write(key, |record, now| {
            retry_at = now + cooldown;
            let status = &mut record.status;
            status.phase = SyncPhase::Error;
            status.last_error = Some(message.clone());
            status.error_class = Some(class);
            status.attempts = status.attempts.saturating_add(1);
            status.next_retry_at = Some(retry_at);
            status.attempted_hash = attempted.map(|a| a.hash);
            if let Some(attempted) = attempted {
                status.aggregated_config = Some(attempted.document.clone());
                status.provenance = attempted.provenance.clone();
            }
            record.claim = None;
        })
        .await?;

        let log_class = match class {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Conflict => "conflict",
        };
        tracing::error!(key = %key, class = log_class, error = %message, %retry_at, "sync failed");
        Ok(retry_at)
    }

    /// Finish a teardown: delete the record once the remote object is gone
    ///
    /// If a producer contributed again meanwhile, the record is kept and
    /// reset so the next cycle re-creates the remote object.
    ///
    /// # Errors
    /// [`SyncError::ClaimLost`] if another replica took over
    pub async fn mark_torn_down(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<TeardownOutcome, SyncError> {
        let holder = self.holder.as_str();
        let applied = update_record(
            self.store.as_ref(),
            key,
            &self.policy,
            |current| -> Result<_, SyncError> {
                let now = Utc::now();
                let mut record = owned(current, key, holder, now)?;
                if record.is_empty() && record.teardown_requested {
                    return Ok(Mutation::Delete(TeardownOutcome::Deleted));
                }
                let status = &mut record.status;
                status.result_data.remove(result_keys::REMOTE_ID);
                status.result_data.remove(result_keys::CONFIG_VERSION);
                status.config_hash = None;
                status.config_version = None;
                status.phase = SyncPhase::Pending;
                record.claim = None;
                Ok(Mutation::Write(record, TeardownOutcome::Revived))
            },
        )
        .await?;

        match applied.output {
            TeardownOutcome::Deleted => tracing::info!(key = %key, "record torn down"),
            TeardownOutcome::Revived => {
                tracing::info!(key = %key, "fragments re-contributed during teardown");
            }
        }
        Ok(applied.output)
    }

    async fn write<F>(&self, key: &ExternalResourceKey, mut apply: F) -> Result<(), SyncError>
    where
        F: FnMut(&mut AggregationRecord, DateTime<Utc>),
    {
        let holder = self.holder.as_str();
        update_record(
            self.store.as_ref(),
            key,
            &self.policy,
            |current| -> Result<_, SyncError> {
                let now = Utc::now();
                let mut record = owned(current, key, holder, now)?;
                apply(&mut record, now);
                Ok(Mutation::Write(record, ()))
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Checkpoint for StatusReporter {
    async fn save(
        &self,
        key: &ExternalResourceKey,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), SyncError> {
        self.record_step(key, name, value).await
    }
}

/// The record, if `holder` still owns its claim
fn owned(
    current: Option<AggregationRecord>,
    key: &ExternalResourceKey,
    holder: &str,
    now: DateTime<Utc>,
) -> Result<AggregationRecord, SyncError> {
    match current {
        Some(record) if record.is_claimed_by(holder, now) => Ok(record),
        _ => Err(SyncError::ClaimLost {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimManager;
    use fragsync_model::{ConfigFragment, ResourceType, SourceRef};
    use fragsync_store::{InMemoryRecordStore, StoreError};
    use serde_json::json;

    const LEASE: std::time::Duration = std::time::Duration::from_secs(30);

    fn key() -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tun")
    }

    async fn claimed_store(holder: &str) -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut record = AggregationRecord::new(key());
        record.upsert_fragment(ConfigFragment::new(
            SourceRef::new("Tunnel", "ns", "a"),
            json!({"loglevel": "info"}),
            1,
        ));
        store.conditional_write(&key(), record, None).await.unwrap();
        let snapshot = store.get(&key()).await.unwrap().unwrap();
        ClaimManager::new(store.clone(), ConflictRetryPolicy::default(), holder, LEASE)
            .try_claim(snapshot, Utc::now())
            .await
            .unwrap()
            .unwrap();
        store
    }

    fn reporter(store: &Arc<InMemoryRecordStore>, holder: &str) -> StatusReporter {
        StatusReporter::new(store.clone(), ConflictRetryPolicy::default(), holder, LEASE)
    }

    fn attempted() -> AttemptedMerge {
        let document = json!({"loglevel": "info"});
        AttemptedMerge {
            hash: ContentHash::of_document(&document),
            document,
            provenance: BTreeMap::from([("/loglevel".to_string(), "Tunnel/ns/a".to_string())]),
        }
    }

    #[tokio::test]
    async fn record_step_checkpoints_immediately() {
        let store = claimed_store("replica-a").await;
        let reporter = reporter(&store, "replica-a");
        reporter
            .record_step(&key(), result_keys::REMOTE_ID, Some("tun-123"))
            .await
            .unwrap();

        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert_eq!(record.status.remote_id(), Some("tun-123"));
        assert_eq!(record.status.phase, SyncPhase::Syncing);

        reporter
            .record_step(&key(), result_keys::REMOTE_ID, None)
            .await
            .unwrap();
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(record.status.remote_id().is_none());
    }

    #[tokio::test]
    async fn mark_synced_advances_hash_and_releases() {
        let store = claimed_store("replica-a").await;
        let merge = attempted();
        reporter(&store, "replica-a")
            .mark_synced(&key(), &merge, Some("v7".to_string()))
            .await
            .unwrap();

        let stored = store.get(&key()).await.unwrap().unwrap();
        let status = &stored.value.status;
        assert_eq!(status.phase, SyncPhase::Synced);
        assert_eq!(status.config_hash, Some(merge.hash));
        assert_eq!(status.config_version.as_deref(), Some("v7"));
        assert_eq!(status.revision, Some(stored.revision));
        assert!(stored.value.claim.is_none());
    }

    #[tokio::test]
    async fn mark_failed_keeps_hash() {
        let store = claimed_store("replica-a").await;
        let error = SyncError::from(StoreError::Backend("disk full".to_string()));
        let merge = attempted();
        let retry_at = reporter(&store, "replica-a")
            .mark_failed(&key(), &error, Some(&merge), std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let status = store.get(&key()).await.unwrap().unwrap().value.status;
        assert_eq!(status.phase, SyncPhase::Error);
        assert!(status.config_hash.is_none());
        assert_eq!(status.attempted_hash, Some(merge.hash));
        assert_eq!(status.attempts, 1);
        assert_eq!(status.next_retry_at, Some(retry_at));
        assert_eq!(status.error_class, Some(ErrorClass::Transient));
        assert!(status.last_error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn writes_without_claim_are_refused() {
        let store = claimed_store("replica-a").await;
        let err = reporter(&store, "replica-b")
            .record_step(&key(), result_keys::REMOTE_ID, Some("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn renewal_pushes_expiry_forward() {
        let store = claimed_store("replica-a").await;
        let before = store.get(&key()).await.unwrap().unwrap().value.claim.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        reporter(&store, "replica-a").renew_claim(&key()).await.unwrap();
        let after = store.get(&key()).await.unwrap().unwrap().value.claim.unwrap();
        assert_eq!(after.holder, "replica-a");
        assert!(after.expires_at > before.expires_at);
        assert_eq!(after.acquired_at, before.acquired_at);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_claim_stops_once_claim_is_gone() {
        let store = claimed_store("replica-a").await;
        let err = reporter(&store, "replica-b").hold_claim(&key()).await;
        assert!(matches!(err, SyncError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn teardown_revived_by_new_fragment() {
        let store = claimed_store("replica-a").await;
        let reporter = reporter(&store, "replica-a");
        reporter
            .record_step(&key(), result_keys::REMOTE_ID, Some("tun-123"))
            .await
            .unwrap();

        // record still has a fragment, so it must survive
        let outcome = reporter.mark_torn_down(&key()).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::Revived);
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(record.status.remote_id().is_none());
        assert_eq!(record.status.phase, SyncPhase::Pending);
    }
}
