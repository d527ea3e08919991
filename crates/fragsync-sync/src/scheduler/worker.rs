//! One sync cycle for one key
//!
//! read -> merge -> hash -> detect -> claim -> execute -> report

use crate::claim::ClaimManager;
use crate::config::SyncConfig;
use crate::detector::{ChangeDetector, SyncReason};
use crate::error::SyncError;
use crate::executor::RemoteExecutor;
use crate::remote::RemoteClient;
use crate::reporter::{AttemptedMerge, StatusReporter, TeardownOutcome};
use chrono::{DateTime, Utc};
use fragsync_merge::{MergeEngine, MergeError};
use fragsync_model::{AggregationRecord, ErrorClass, ExternalResourceKey};
use fragsync_store::RecordStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No record for the key
    Missing,
    /// Nothing to do
    UpToDate,
    /// Last failure still cooling down
    CoolingDown {
        /// When a retry becomes due
        until: Option<DateTime<Utc>>,
    },
    /// Another replica owns the key, or the record moved under us
    Skipped,
    /// Remote object matches the merged document
    Synced,
    /// Remote object and record deleted
    TornDown,
    /// Teardown interrupted by a new contribution; record kept for re-sync
    Revived,
    /// Attempt failed and was recorded
    Failed {
        /// Failure class
        class: ErrorClass,
        /// Delay before the scheduler re-queues
        retry_after: Duration,
    },
}

impl CycleOutcome {
    /// Label for metrics and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::UpToDate => "up_to_date",
            Self::CoolingDown { .. } => "cooling_down",
            Self::Skipped => "skipped",
            Self::Synced => "synced",
            Self::TornDown => "torn_down",
            Self::Revived => "revived",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Runs sync cycles; shared by every worker task of a replica
#[derive(Clone)]
pub struct SyncWorker {
    store: Arc<dyn RecordStore>,
    engine: MergeEngine,
    detector: ChangeDetector,
    claims: ClaimManager,
    reporter: StatusReporter,
    executor: RemoteExecutor,
    transient_cooldown: Duration,
    permanent_cooldown: Duration,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("detector", &self.detector)
            .field("claims", &self.claims)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    /// Create worker from configuration
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: Arc<dyn RemoteClient>,
        engine: MergeEngine,
        config: &SyncConfig,
    ) -> Self {
        let policy = config.conflict.policy();
        let interval = config.revalidation_interval();
        Self {
            detector: ChangeDetector::new((!interval.is_zero()).then_some(interval)),
            claims: ClaimManager::new(
                store.clone(),
                policy.clone(),
                config.replica_id.clone(),
                config.claim_lease(),
            ),
            reporter: StatusReporter::new(
                store.clone(),
                policy,
                config.replica_id.clone(),
                config.claim_lease(),
            ),
            executor: RemoteExecutor::new(client, config.remote.clone()),
            store,
            engine,
            transient_cooldown: config.transient_cooldown(),
            permanent_cooldown: config.permanent_cooldown(),
        }
    }

    /// Merge engine in use
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &MergeEngine {
        &self.engine
    }

    /// Run one cycle for `key`
    ///
    /// Failures of the remote plan are recorded in the status and reported
    /// as [`CycleOutcome::Failed`]; `Err` means even that write failed.
    ///
    /// # Errors
    /// Store failures outside the conflict-retry loop
    pub async fn run_cycle(&self, key: &ExternalResourceKey) -> Result<CycleOutcome, SyncError> {
        let now = Utc::now();
        let Some(snapshot) = self.store.get(key).await? else {
            return Ok(CycleOutcome::Missing);
        };

        let merged = self.merge(&snapshot.value);
        let current = match &merged {
            Some(Ok(attempt)) => Some(attempt.hash),
            _ => None,
        };
        let decision = self.detector.needs_sync(&snapshot.value, current.as_ref(), now);
        match decision.reason {
            SyncReason::UpToDate => return Ok(CycleOutcome::UpToDate),
            SyncReason::CoolingDown => {
                return Ok(CycleOutcome::CoolingDown {
                    until: snapshot.value.status.next_retry_at,
                })
            }
            reason => tracing::debug!(key = %key, %reason, "sync needed"),
        }

        let Some(claimed) = self.claims.try_claim(snapshot, now).await? else {
            return Ok(CycleOutcome::Skipped);
        };
        let result_data = claimed.value.status.result_data;
        tracing::info!(
            key = %key,
            reason = %decision.reason,
            steps = ?RemoteExecutor::plan(&result_data, decision.is_teardown()),
            "sync started"
        );

        if decision.is_teardown() {
            let teardown = self.executor.teardown(key, &result_data, &self.reporter);
            return match self.holding_claim(key, teardown).await {
                Ok(()) => match self.reporter.mark_torn_down(key).await {
                    Ok(TeardownOutcome::Deleted) => Ok(CycleOutcome::TornDown),
                    Ok(TeardownOutcome::Revived) => Ok(CycleOutcome::Revived),
                    Err(err) => self.fail(key, err, None).await,
                },
                Err(err) => self.fail(key, err, None).await,
            };
        }

        let attempt = match merged {
            Some(Ok(attempt)) => attempt,
            Some(Err(err)) => return self.fail(key, err.into(), None).await,
            None => {
                self.claims.release(key).await?;
                return Ok(CycleOutcome::UpToDate);
            }
        };

        let apply = self
            .executor
            .apply(key, &result_data, &attempt.document, &self.reporter);
        match self.holding_claim(key, apply).await {
            Ok(outcome) => match self
                .reporter
                .mark_synced(key, &attempt, outcome.config_version)
                .await
            {
                Ok(()) => Ok(CycleOutcome::Synced),
                Err(err) => self.fail(key, err, Some(&attempt)).await,
            },
            Err(err) => self.fail(key, err, Some(&attempt)).await,
        }
    }

    /// Run `work` while renewing the claim; a failed renewal abandons it
    async fn holding_claim<T>(
        &self,
        key: &ExternalResourceKey,
        work: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncError> {
        tokio::select! {
            biased;
            result = work => result,
            err = self.reporter.hold_claim(key) => {
                tracing::warn!(key = %key, error = %err, "claim renewal failed, abandoning remote steps");
                Err(err)
            }
        }
    }

    fn merge(&self, record: &AggregationRecord) -> Option<Result<AttemptedMerge, MergeError>> {
        if record.is_empty() {
            return None;
        }
        Some(
            self.engine
                .merge(&record.key.resource_type, record.fragments())
                .map(|outcome| AttemptedMerge {
                    hash: ChangeDetector::hash(&outcome.document),
                    provenance: outcome.provenance.to_string_map(),
                    document: outcome.document.into_value(),
                }),
        )
    }

    async fn fail(
        &self,
        key: &ExternalResourceKey,
        err: SyncError,
        attempted: Option<&AttemptedMerge>,
    ) -> Result<CycleOutcome, SyncError> {
        if let SyncError::ClaimLost { .. } = err {
            tracing::warn!(key = %key, "claim lost mid-sync, leaving key to its new owner");
            return Ok(CycleOutcome::Skipped);
        }
        let class = err.class();
        let retry_after = match class {
            ErrorClass::Permanent => self.permanent_cooldown,
            ErrorClass::Transient | ErrorClass::Conflict => self.transient_cooldown,
        };
        match self
            .reporter
            .mark_failed(key, &err, attempted, retry_after)
            .await
        {
            Ok(_) => Ok(CycleOutcome::Failed { class, retry_after }),
            Err(SyncError::ClaimLost { .. }) => Ok(CycleOutcome::Skipped),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockRemoteClient, RemoteError, RemoteErrorKind};
    use fragsync_model::{result_keys, ConfigFragment, ResourceType, SourceRef, SyncPhase};
    use fragsync_store::InMemoryRecordStore;
    use serde_json::json;

    fn key() -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tun")
    }

    async fn store_with(payload: serde_json::Value) -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut record = AggregationRecord::new(key());
        record.upsert_fragment(ConfigFragment::new(
            SourceRef::new("Tunnel", "ns", "a"),
            payload,
            1,
        ));
        store.conditional_write(&key(), record, None).await.unwrap();
        store
    }

    fn worker(store: &Arc<InMemoryRecordStore>, mock: MockRemoteClient) -> SyncWorker {
        let config = SyncConfig::default()
            .with_replica_id("replica-a")
            .with_remote(crate::config::RemoteRetryConfig::default().with_max_attempts(1));
        SyncWorker::new(store.clone(), Arc::new(mock), MergeEngine::with_defaults(), &config)
    }

    #[tokio::test]
    async fn missing_record() {
        let store = Arc::new(InMemoryRecordStore::new());
        let outcome = worker(&store, MockRemoteClient::new())
            .run_cycle(&key())
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Missing);
    }

    #[tokio::test]
    async fn second_cycle_is_a_no_op() {
        let store = store_with(json!({"loglevel": "info"})).await;
        let mut mock = MockRemoteClient::new();
        mock.expect_exists().times(1).returning(|_| Ok(None));
        mock.expect_create()
            .times(1)
            .returning(|_, _| Ok("tun-1".to_string()));
        mock.expect_update().times(1).returning(|_, _| Ok(()));
        mock.expect_config_version().returning(|_| Ok(None));
        let worker = worker(&store, mock);

        assert_eq!(worker.run_cycle(&key()).await.unwrap(), CycleOutcome::Synced);
        let revision = store.get(&key()).await.unwrap().unwrap().revision;

        assert_eq!(worker.run_cycle(&key()).await.unwrap(), CycleOutcome::UpToDate);
        assert_eq!(store.get(&key()).await.unwrap().unwrap().revision, revision);
    }

    #[tokio::test]
    async fn remote_rejection_is_recorded() {
        let store = store_with(json!({"loglevel": "info"})).await;
        let mut mock = MockRemoteClient::new();
        mock.expect_exists()
            .returning(|_| Ok(Some("tun-1".to_string())));
        mock.expect_update()
            .times(1)
            .returning(|_, _| Err(RemoteError::new(RemoteErrorKind::Invalid, "bad origin")));
        let worker = worker(&store, mock);

        let outcome = worker.run_cycle(&key()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                class: ErrorClass::Permanent,
                ..
            }
        ));

        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert_eq!(record.status.phase, SyncPhase::Error);
        assert_eq!(record.status.remote_id(), Some("tun-1"));
        assert!(record.status.config_hash.is_none());
        assert!(record.claim.is_none());

        // same fragments, still cooling down: no remote call
        assert!(matches!(
            worker.run_cycle(&key()).await.unwrap(),
            CycleOutcome::CoolingDown { until: Some(_) }
        ));
    }

    #[tokio::test]
    async fn broken_payload_fails_without_remote_calls() {
        let store = store_with(json!({"ingress": "not-a-list"})).await;
        let outcome = worker(&store, MockRemoteClient::new())
            .run_cycle(&key())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                class: ErrorClass::Permanent,
                ..
            }
        ));
        let status = store.get(&key()).await.unwrap().unwrap().value.status;
        assert!(status.last_error.unwrap().contains("merge failed"));
        assert!(status.result_data.get(result_keys::REMOTE_ID).is_none());
    }
}
