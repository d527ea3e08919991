//! Remote client whose updates take longer than a claim lease

use crate::spy::SpyRemote;
use async_trait::async_trait;
use fragsync_model::ExternalResourceKey;
use fragsync_sync::{RemoteClient, RemoteError};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps [`SpyRemote`], delaying every `update` and tracking how many calls
/// overlap
#[derive(Debug)]
pub struct SlowRemote {
    inner: Arc<SpyRemote>,
    update_latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowRemote {
    pub fn new(inner: Arc<SpyRemote>, update_latency: Duration) -> Self {
        Self {
            inner,
            update_latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn spy(&self) -> &Arc<SpyRemote> {
        &self.inner
    }

    /// Most calls ever running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn tracked<T>(&self, delay: Duration, call: impl std::future::Future<Output = T>) -> T {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        let out = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl RemoteClient for SlowRemote {
    async fn exists(&self, key: &ExternalResourceKey) -> Result<Option<String>, RemoteError> {
        self.tracked(Duration::ZERO, self.inner.exists(key)).await
    }

    async fn create(
        &self,
        key: &ExternalResourceKey,
        document: &JsonValue,
    ) -> Result<String, RemoteError> {
        self.tracked(Duration::ZERO, self.inner.create(key, document))
            .await
    }

    async fn update(&self, remote_id: &str, document: &JsonValue) -> Result<(), RemoteError> {
        self.tracked(self.update_latency, self.inner.update(remote_id, document))
            .await
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        self.tracked(Duration::ZERO, self.inner.delete(remote_id))
            .await
    }

    async fn config_version(&self, remote_id: &str) -> Result<Option<String>, RemoteError> {
        self.tracked(Duration::ZERO, self.inner.config_version(remote_id))
            .await
    }
}
