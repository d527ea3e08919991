//! Aggregator facade
//!
//! Wires the fragment store, merge engine, remote executor and scheduler
//! into one object a host process embeds.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::remote::RemoteClient;
use crate::scheduler::{CycleOutcome, SchedulerHandle, SyncScheduler, SyncWorker};
use fragsync_merge::{MergeEngine, MergeOutcome};
use fragsync_model::{ExternalResourceKey, SourceRef, SyncStatus};
use fragsync_store::{FragmentStore, ProducerHandle, RecordStore};
use std::sync::Arc;

/// Fragment aggregation and sync engine
pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    client: Arc<dyn RemoteClient>,
    fragments: FragmentStore,
    worker: SyncWorker,
    config: SyncConfig,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Create aggregator with the built-in merge schemas
    ///
    /// # Errors
    /// [`SyncError::Config`] if `config` does not validate
    pub fn new(
        store: Arc<dyn RecordStore>,
        client: Arc<dyn RemoteClient>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let fragments = FragmentStore::with_policy(store.clone(), config.conflict.policy());
        let worker = SyncWorker::new(
            store.clone(),
            client.clone(),
            MergeEngine::with_defaults(),
            &config,
        );
        Ok(Self {
            store,
            client,
            fragments,
            worker,
            config,
        })
    }

    /// Replace the merge engine
    #[must_use]
    pub fn with_engine(mut self, engine: MergeEngine) -> Self {
        self.worker = SyncWorker::new(
            self.store.clone(),
            self.client.clone(),
            engine,
            &self.config,
        );
        self
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fragment store shared by all producers
    #[inline]
    #[must_use]
    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    /// Handle for one producer
    #[must_use]
    pub fn producer(&self, source: SourceRef) -> ProducerHandle {
        self.fragments.producer(source)
    }

    /// Force a sync of `key` on the next cycle, even if nothing changed
    ///
    /// # Errors
    /// Store failures, including a missing record
    pub async fn request_resync(&self, key: &ExternalResourceKey) -> Result<(), SyncError> {
        self.fragments.request_resync(key).await?;
        tracing::info!(key = %key, "resync requested");
        Ok(())
    }

    /// Current sync status of `key`
    ///
    /// # Errors
    /// Store failures
    pub async fn status(&self, key: &ExternalResourceKey) -> Result<Option<SyncStatus>, SyncError> {
        Ok(self.fragments.get(key).await?.map(|v| v.value.status))
    }

    /// Merge the stored fragments of `key` without syncing
    ///
    /// # Errors
    /// Store failures, or [`SyncError::Merge`] on a malformed payload
    pub async fn preview(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<Option<MergeOutcome>, SyncError> {
        let Some(record) = self.fragments.get(key).await? else {
            return Ok(None);
        };
        let outcome = self
            .worker
            .engine()
            .merge(&key.resource_type, record.value.fragments())?;
        Ok(Some(outcome))
    }

    /// Run one cycle for `key` in the calling task
    ///
    /// # Errors
    /// See [`SyncWorker::run_cycle`]
    pub async fn sync_once(&self, key: &ExternalResourceKey) -> Result<CycleOutcome, SyncError> {
        self.worker.run_cycle(key).await
    }

    /// Run one cycle for every stored key, in key order
    ///
    /// # Errors
    /// The first store failure
    pub async fn sync_all(&self) -> Result<Vec<(ExternalResourceKey, CycleOutcome)>, SyncError> {
        let keys = self.fragments.list_keys().await?;
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let outcome = self.worker.run_cycle(&key).await?;
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }

    /// Start the background scheduler
    #[must_use]
    pub fn start(&self) -> SchedulerHandle {
        SyncScheduler::new(self.worker.clone(), self.store.clone(), &self.config).start()
    }
}
