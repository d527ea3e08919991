//! ConfigSource store
//!
//! [`FragmentStore`] is the producer-facing side of the aggregator. Producers
//! co-own records without coordinating; every change is a conditional write
//! through [`update_record`].

use crate::backend::RecordStore;
use crate::error::StoreError;
use crate::retry::{update_record, ConflictRetryPolicy, Mutation};
use fragsync_model::{
    AggregationRecord, ConfigFragment, CredentialsRef, ExternalResourceKey, SourceRef,
    UpsertEffect, Versioned,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Fragment sets per external resource
#[derive(Clone)]
pub struct FragmentStore {
    backend: Arc<dyn RecordStore>,
    policy: ConflictRetryPolicy,
}

impl std::fmt::Debug for FragmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FragmentStore {
    /// Create over a backend with the default retry policy
    #[must_use]
    pub fn new(backend: Arc<dyn RecordStore>) -> Self {
        Self::with_policy(backend, ConflictRetryPolicy::default())
    }

    /// Create with a custom retry policy
    #[must_use]
    pub fn with_policy(backend: Arc<dyn RecordStore>, policy: ConflictRetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Underlying backend
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn RecordStore> {
        &self.backend
    }

    /// Retry policy in use
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &ConflictRetryPolicy {
        &self.policy
    }

    /// Handle bound to one producer identity
    #[must_use]
    pub fn producer(&self, source: SourceRef) -> ProducerHandle {
        ProducerHandle {
            store: self.clone(),
            source,
        }
    }

    /// Current record
    ///
    /// # Errors
    /// Backend failures
    pub async fn get(
        &self,
        key: &ExternalResourceKey,
    ) -> Result<Option<Versioned<AggregationRecord>>, StoreError> {
        self.backend.get(key).await
    }

    /// All record keys
    ///
    /// # Errors
    /// Backend failures
    pub async fn list_keys(&self) -> Result<Vec<ExternalResourceKey>, StoreError> {
        self.backend.list_keys().await
    }

    /// Insert or replace the fragment owned by `fragment.source`
    ///
    /// Creates the record on first contribution and cancels a pending
    /// teardown. A content-identical fragment causes no write.
    ///
    /// # Errors
    /// [`StoreError::ContentionExhausted`] if every attempt lost a race
    pub async fn upsert(
        &self,
        key: &ExternalResourceKey,
        fragment: ConfigFragment,
    ) -> Result<UpsertEffect, StoreError> {
        let applied = update_record(self.backend.as_ref(), key, &self.policy, |current| {
            let mut record = current.unwrap_or_else(|| AggregationRecord::new(key.clone()));
            let effect = record.upsert_fragment(fragment.clone());
            if effect == UpsertEffect::Unchanged && !record.teardown_requested {
                return Ok::<_, StoreError>(Mutation::Skip(effect));
            }
            record.teardown_requested = false;
            Ok(Mutation::Write(record, effect))
        })
        .await?;

        tracing::debug!(
            key = %key,
            source = %fragment.source,
            effect = ?applied.output,
            "fragment upserted"
        );
        Ok(applied.output)
    }

    /// Delete the fragment owned by `source`
    ///
    /// Removing the last fragment marks the record for teardown; the record
    /// itself stays until the remote object is deleted. Returns false if
    /// there was nothing to remove.
    ///
    /// # Errors
    /// [`StoreError::ContentionExhausted`] if every attempt lost a race
    pub async fn remove(
        &self,
        key: &ExternalResourceKey,
        source: &SourceRef,
    ) -> Result<bool, StoreError> {
        let applied = update_record(self.backend.as_ref(), key, &self.policy, |current| {
            let Some(mut record) = current else {
                return Ok::<_, StoreError>(Mutation::Skip(false));
            };
            if record.remove_fragment(source).is_none() {
                return Ok(Mutation::Skip(false));
            }
            if record.is_empty() {
                record.teardown_requested = true;
            }
            Ok(Mutation::Write(record, true))
        })
        .await?;

        if applied.output {
            tracing::debug!(key = %key, source = %source, "fragment removed");
        }
        Ok(applied.output)
    }

    /// Ask for a sync on the next scheduler pass even if nothing changed
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if no record exists for `key`
    pub async fn request_resync(&self, key: &ExternalResourceKey) -> Result<(), StoreError> {
        update_record(
            self.backend.as_ref(),
            key,
            &self.policy,
            |current| -> Result<_, StoreError> {
                let mut record = current.ok_or_else(|| StoreError::not_found(key))?;
                if record.resync_requested {
                    return Ok(Mutation::Skip(()));
                }
                record.resync_requested = true;
                Ok(Mutation::Write(record, ()))
            },
        )
        .await?;
        tracing::info!(key = %key, "resync requested");
        Ok(())
    }

    /// Set the remote API credentials for `key`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if no record exists for `key`
    pub async fn set_credentials(
        &self,
        key: &ExternalResourceKey,
        credentials: CredentialsRef,
    ) -> Result<(), StoreError> {
        update_record(
            self.backend.as_ref(),
            key,
            &self.policy,
            |current| -> Result<_, StoreError> {
                let mut record = current.ok_or_else(|| StoreError::not_found(key))?;
                if record.credentials.as_ref() == Some(&credentials) {
                    return Ok(Mutation::Skip(()));
                }
                record.credentials = Some(credentials.clone());
                Ok(Mutation::Write(record, ()))
            },
        )
        .await?;
        Ok(())
    }
}

/// A producer's view of the store
///
/// Every fragment written through a handle carries the handle's
/// [`SourceRef`], so a producer can only touch its own fragments.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    store: FragmentStore,
    source: SourceRef,
}

impl ProducerHandle {
    /// Producer identity
    #[inline]
    #[must_use]
    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    /// Contribute (or replace) this producer's fragment for `key`
    ///
    /// Safe to call repeatedly with identical arguments.
    ///
    /// # Errors
    /// [`StoreError::ContentionExhausted`]; the caller may simply re-invoke
    pub async fn contribute_fragment(
        &self,
        key: &ExternalResourceKey,
        payload: JsonValue,
        priority: i32,
    ) -> Result<UpsertEffect, StoreError> {
        let fragment = ConfigFragment::new(self.source.clone(), payload, priority);
        self.store.upsert(key, fragment).await
    }

    /// Withdraw this producer's fragment for `key`
    ///
    /// # Errors
    /// [`StoreError::ContentionExhausted`]; the caller may simply re-invoke
    pub async fn withdraw_fragment(&self, key: &ExternalResourceKey) -> Result<bool, StoreError> {
        self.store.remove(key, &self.source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecordStore;
    use fragsync_model::ResourceType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryRecordStore>, FragmentStore) {
        let backend = Arc::new(InMemoryRecordStore::new());
        let store = FragmentStore::new(backend.clone());
        (backend, store)
    }

    fn key() -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tunnel-1")
    }

    #[tokio::test]
    async fn first_contribution_creates_record() {
        let (_, store) = setup();
        let producer = store.producer(SourceRef::new("Tunnel", "default", "edge"));

        let effect = producer
            .contribute_fragment(&key(), json!({"loglevel": "info"}), 10)
            .await
            .unwrap();

        assert_eq!(effect, UpsertEffect::Inserted);
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert_eq!(record.fragments().len(), 1);
        assert_eq!(record.fragments()[0].source, *producer.source());
    }

    #[tokio::test]
    async fn identical_contribution_is_not_written() {
        let (backend, store) = setup();
        let producer = store.producer(SourceRef::new("Tunnel", "default", "edge"));
        producer
            .contribute_fragment(&key(), json!({"a": 1}), 10)
            .await
            .unwrap();
        let before = backend.get(&key()).await.unwrap().unwrap().revision;
        let mut events = backend.subscribe();

        let effect = producer
            .contribute_fragment(&key(), json!({"a": 1}), 10)
            .await
            .unwrap();

        assert_eq!(effect, UpsertEffect::Unchanged);
        assert_eq!(backend.get(&key()).await.unwrap().unwrap().revision, before);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_last_fragment_requests_teardown() {
        let (_, store) = setup();
        let a = store.producer(SourceRef::new("Tunnel", "default", "a"));
        let b = store.producer(SourceRef::new("Tunnel", "default", "b"));
        a.contribute_fragment(&key(), json!({"x": 1}), 1).await.unwrap();
        b.contribute_fragment(&key(), json!({"y": 1}), 2).await.unwrap();

        assert!(a.withdraw_fragment(&key()).await.unwrap());
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(!record.teardown_requested);

        assert!(b.withdraw_fragment(&key()).await.unwrap());
        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(record.is_empty());
        assert!(record.teardown_requested);

        // withdrawing again is a no-op
        assert!(!b.withdraw_fragment(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn recontribution_cancels_teardown() {
        let (_, store) = setup();
        let a = store.producer(SourceRef::new("Tunnel", "default", "a"));
        a.contribute_fragment(&key(), json!({"x": 1}), 1).await.unwrap();
        a.withdraw_fragment(&key()).await.unwrap();
        a.contribute_fragment(&key(), json!({"x": 1}), 1).await.unwrap();

        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(!record.teardown_requested);
        assert_eq!(record.fragments().len(), 1);
    }

    #[tokio::test]
    async fn withdraw_from_missing_record() {
        let (backend, store) = setup();
        let a = store.producer(SourceRef::new("Tunnel", "default", "a"));
        assert!(!a.withdraw_fragment(&key()).await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn resync_and_credentials_need_a_record() {
        let (_, store) = setup();
        assert!(matches!(
            store.request_resync(&key()).await,
            Err(StoreError::NotFound(_))
        ));

        store
            .producer(SourceRef::new("Tunnel", "default", "a"))
            .contribute_fragment(&key(), json!({}), 1)
            .await
            .unwrap();
        store.request_resync(&key()).await.unwrap();
        store
            .set_credentials(&key(), CredentialsRef::new("ops", "api-token"))
            .await
            .unwrap();

        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert!(record.resync_requested);
        assert_eq!(record.credentials, Some(CredentialsRef::new("ops", "api-token")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_lose_no_updates() {
        let (_, store) = setup();
        let store = FragmentStore::with_policy(
            store.backend().clone(),
            ConflictRetryPolicy::new().with_max_attempts(64),
        );

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let producer = store.producer(SourceRef::new("Dns", "default", format!("p{i:02}")));
                tokio::spawn(async move {
                    producer
                        .contribute_fragment(&key(), json!({"records": [{"name": format!("h{i}")}]}), i)
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let record = store.get(&key()).await.unwrap().unwrap().value;
        assert_eq!(record.fragments().len(), 16);
    }
}
