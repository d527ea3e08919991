//! Bounded read-modify-write loop
//!
//! Every mutator (producers, claims, status writes) goes through
//! [`update_record`]: read the record and its revision, apply the logical
//! change, write back conditioned on the revision. On conflict the change is
//! re-applied to a fresh read after a jittered pause.

use crate::backend::RecordStore;
use crate::error::StoreError;
use fragsync_model::{AggregationRecord, ExternalResourceKey, RevisionToken};
use rand::Rng;
use std::time::Duration;

/// Retry policy for conflicting conditional writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff base
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl ConflictRetryPolicy {
    /// Create policy with default values
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set attempt bound
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set backoff base
    #[inline]
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set backoff ceiling
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Exponential cap for a retry (0-based)
    #[must_use]
    pub fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full-jitter pause before a retry: uniform in `[0, ceiling]`
    #[must_use]
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }
}

/// Outcome of one logical change
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    /// Write this record
    Write(AggregationRecord, T),
    /// Delete the record that was read
    Delete(T),
    /// Nothing to do
    Skip(T),
}

/// Result of a committed [`update_record`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<T> {
    /// Value produced by the mutation
    pub output: T,
    /// Revision after the change; the read revision on skip, `None` once deleted
    pub revision: Option<RevisionToken>,
    /// True if the store was actually written
    pub written: bool,
}

/// Apply `mutate` to the current record with optimistic concurrency
///
/// `mutate` receives the current record (or `None`) and may be invoked once
/// per attempt, so it must be a pure function of its input.
///
/// # Errors
/// - [`StoreError::ContentionExhausted`] after `policy.max_attempts` conflicts
/// - any non-conflict error from the store or from `mutate`, unchanged
pub async fn update_record<S, T, E, F>(
    store: &S,
    key: &ExternalResourceKey,
    policy: &ConflictRetryPolicy,
    mut mutate: F,
) -> Result<Applied<T>, E>
where
    S: RecordStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(Option<AggregationRecord>) -> Result<Mutation<T>, E>,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.jittered_delay(attempt - 1)).await;
        }

        let current = store.get(key).await?;
        let read_revision = current.as_ref().map(|v| v.revision);

        let result = match mutate(current.map(|v| v.value))? {
            Mutation::Skip(output) => {
                return Ok(Applied {
                    output,
                    revision: read_revision,
                    written: false,
                })
            }
            Mutation::Write(record, output) => store
                .conditional_write(key, record, read_revision)
                .await
                .map(|revision| Applied {
                    output,
                    revision: Some(revision),
                    written: true,
                }),
            Mutation::Delete(output) => match read_revision {
                Some(revision) => store
                    .conditional_delete(key, revision)
                    .await
                    .map(|()| Applied {
                        output,
                        revision: None,
                        written: true,
                    }),
                None => {
                    return Ok(Applied {
                        output,
                        revision: None,
                        written: false,
                    })
                }
            },
        };

        match result {
            Ok(applied) => return Ok(applied),
            Err(err) if err.is_conflict() => {
                metrics::counter!("fragsync_write_conflicts_total").increment(1);
                tracing::debug!(key = %key, attempt = attempt + 1, error = %err, "write conflict, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }

    tracing::warn!(key = %key, attempts, "write contention exhausted");
    Err(StoreError::ContentionExhausted {
        key: key.to_string(),
        attempts,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecordStore;
    use crate::StoreEvent;
    use async_trait::async_trait;
    use fragsync_model::{ResourceType, Versioned};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    /// Fails the first `failures` conditional writes with a conflict
    struct FlakyStore {
        inner: InMemoryRecordStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
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
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::conflict(key, expected, None));
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

    fn key() -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::TunnelConfig, "acct", "tun")
    }

    fn fast_policy() -> ConflictRetryPolicy {
        ConflictRetryPolicy::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    fn create(record: Option<AggregationRecord>) -> Result<Mutation<()>, StoreError> {
        Ok(Mutation::Write(
            record.unwrap_or_else(|| AggregationRecord::new(key())),
            (),
        ))
    }

    #[tokio::test]
    async fn retries_through_transient_conflicts() {
        let store = FlakyStore {
            inner: InMemoryRecordStore::new(),
            failures: AtomicU32::new(3),
        };
        let mut calls = 0;
        let applied = update_record(&store, &key(), &fast_policy(), |record| {
            calls += 1;
            create(record)
        })
        .await
        .unwrap();

        assert!(applied.written);
        assert_eq!(calls, 4);
        assert!(store.inner.get(&key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let store = FlakyStore {
            inner: InMemoryRecordStore::new(),
            failures: AtomicU32::new(100),
        };
        let err = update_record(&store, &key(), &fast_policy(), create)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::ContentionExhausted {
                key: key().to_string(),
                attempts: 5
            }
        );
    }

    #[tokio::test]
    async fn skip_does_not_write() {
        let store = InMemoryRecordStore::new();
        let mut events = store.subscribe();
        let applied = update_record(&store, &key(), &fast_policy(), |_| {
            Ok::<_, StoreError>(Mutation::Skip(42))
        })
        .await
        .unwrap();
        assert_eq!(applied.output, 42);
        assert!(!applied.written);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = InMemoryRecordStore::new();
        update_record(&store, &key(), &fast_policy(), create)
            .await
            .unwrap();
        let applied = update_record(&store, &key(), &fast_policy(), |_| {
            Ok::<_, StoreError>(Mutation::Delete(()))
        })
        .await
        .unwrap();
        assert!(applied.written);
        assert_eq!(applied.revision, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn mutate_error_aborts_without_retry() {
        let store = InMemoryRecordStore::new();
        let mut calls = 0;
        let err = update_record(&store, &key(), &fast_policy(), |_| {
            calls += 1;
            Err::<Mutation<()>, _>(StoreError::not_found(&key()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(calls, 1);
    }

    proptest! {
        #[test]
        fn prop_jitter_within_ceiling(retry in 0u32..40) {
            let policy = ConflictRetryPolicy::default();
            let delay = policy.jittered_delay(retry);
            prop_assert!(delay <= policy.ceiling(retry));
            prop_assert!(policy.ceiling(retry) <= policy.max_delay);
        }
    }
}
