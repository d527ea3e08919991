//! Remote sync executor
//!
//! Runs the remote plan for one record. Each step checkpoints its output
//! before the next starts, so a cycle that dies half way resumes from the
//! last completed step instead of creating a second remote object.
//!
//! ```text
//! apply:    ensure-exists -> checkpoint remote_id -> update-config -> checkpoint config_version
//! teardown: delete-remote -> clear remote_id
//! ```

use crate::config::RemoteRetryConfig;
use crate::error::SyncError;
use crate::remote::{RemoteClient, RemoteError, RemoteErrorKind};
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use fragsync_model::{result_keys, ExternalResourceKey, ResultData};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Durable sink for step outputs
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Persist `value` under `name`; `None` clears it
    async fn save(
        &self,
        key: &ExternalResourceKey,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), SyncError>;
}

/// One remote step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanStep {
    /// Find or create the remote object
    EnsureExists,
    /// Push the merged document
    UpdateConfig,
    /// Delete the remote object
    DeleteRemote,
}

impl PlanStep {
    /// Step name used in logs, metrics and errors
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::EnsureExists => "ensure-exists",
            Self::UpdateConfig => "update-config",
            Self::DeleteRemote => "delete-remote",
        }
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Remote object id
    pub remote_id: String,
    /// Remote-side version, if the API reports one
    pub config_version: Option<String>,
}

/// Outputs gathered while a plan runs
struct Progress {
    remote_id: Option<String>,
    config_version: Option<String>,
}

/// Drives [`RemoteClient`] calls with retry, timeout and checkpointing
#[derive(Clone)]
pub struct RemoteExecutor {
    client: Arc<dyn RemoteClient>,
    retry: RemoteRetryConfig,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutor {
    /// Create executor
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>, retry: RemoteRetryConfig) -> Self {
        Self { client, retry }
    }

    /// Steps still outstanding for a record with `result_data` checkpointed
    #[must_use]
    pub fn plan(result_data: &ResultData, teardown: bool) -> Vec<PlanStep> {
        if teardown {
            vec![PlanStep::DeleteRemote]
        } else if result_data.contains_key(result_keys::REMOTE_ID) {
            vec![PlanStep::UpdateConfig]
        } else {
            vec![PlanStep::EnsureExists, PlanStep::UpdateConfig]
        }
    }

    /// Make the remote object match `document`
    ///
    /// Runs the steps [`plan`](Self::plan) returns for `result_data`.
    ///
    /// # Errors
    /// [`SyncError::Remote`] once retries are exhausted or on a permanent
    /// failure; checkpoint errors as returned by `checkpoint`
    pub async fn apply(
        &self,
        key: &ExternalResourceKey,
        result_data: &ResultData,
        document: &JsonValue,
        checkpoint: &dyn Checkpoint,
    ) -> Result<ApplyOutcome, SyncError> {
        let progress = self
            .run_plan(key, result_data, Some(document), checkpoint)
            .await?;
        let remote_id = progress.remote_id.ok_or_else(|| {
            SyncError::remote(
                PlanStep::EnsureExists.name(),
                RemoteError::new(RemoteErrorKind::NotFound, "plan finished without a remote id"),
            )
        })?;
        Ok(ApplyOutcome {
            remote_id,
            config_version: progress.config_version,
        })
    }

    /// Delete the remote object for `key`
    ///
    /// A missing object counts as deleted.
    ///
    /// # Errors
    /// [`SyncError::Remote`] once retries are exhausted or on a permanent
    /// failure; checkpoint errors as returned by `checkpoint`
    pub async fn teardown(
        &self,
        key: &ExternalResourceKey,
        result_data: &ResultData,
        checkpoint: &dyn Checkpoint,
    ) -> Result<(), SyncError> {
        self.run_plan(key, result_data, None, checkpoint).await?;
        Ok(())
    }

    /// Execute the plan for `result_data`; `document: None` plans a teardown
    async fn run_plan(
        &self,
        key: &ExternalResourceKey,
        result_data: &ResultData,
        document: Option<&JsonValue>,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Progress, SyncError> {
        let mut progress = Progress {
            remote_id: result_data.get(result_keys::REMOTE_ID).cloned(),
            config_version: None,
        };
        if let Some(id) = progress.remote_id.as_deref() {
            tracing::debug!(key = %key, remote_id = id, "remote id already checkpointed");
        }

        for step in Self::plan(result_data, document.is_none()) {
            let op = step.name();
            match (step, document) {
                (PlanStep::EnsureExists, Some(document)) => {
                    let id = self.ensure_exists(key, document).await?;
                    checkpoint
                        .save(key, result_keys::REMOTE_ID, Some(&id))
                        .await?;
                    tracing::info!(key = %key, remote_id = %id, "remote object ensured");
                    progress.remote_id = Some(id);
                }
                (PlanStep::UpdateConfig, Some(document)) => {
                    let Some(id) = progress.remote_id.as_deref() else {
                        return Err(SyncError::remote(
                            op,
                            RemoteError::new(RemoteErrorKind::NotFound, "no remote object to update"),
                        ));
                    };
                    progress.config_version =
                        self.update_config(key, id, document, checkpoint).await?;
                }
                (PlanStep::DeleteRemote, _) => {
                    self.delete_remote(key, progress.remote_id.as_deref())
                        .await?;
                    checkpoint.save(key, result_keys::REMOTE_ID, None).await?;
                    progress.remote_id = None;
                }
                (PlanStep::EnsureExists | PlanStep::UpdateConfig, None) => {
                    return Err(SyncError::remote(
                        op,
                        RemoteError::new(RemoteErrorKind::Invalid, "no document to push"),
                    ));
                }
            }
        }
        Ok(progress)
    }

    async fn ensure_exists(
        &self,
        key: &ExternalResourceKey,
        document: &JsonValue,
    ) -> Result<String, SyncError> {
        let client = self.client.as_ref();
        let op = PlanStep::EnsureExists.name();
        self.call(op, key, move || async move {
            match client.exists(key).await? {
                Some(id) => Ok(id),
                None => client.create(key, document).await,
            }
        })
        .await
        .map_err(|e| SyncError::remote(op, e))
    }

    async fn update_config(
        &self,
        key: &ExternalResourceKey,
        id: &str,
        document: &JsonValue,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Option<String>, SyncError> {
        let client = self.client.as_ref();
        let op = PlanStep::UpdateConfig.name();
        if let Err(err) = self
            .call(op, key, move || client.update(id, document))
            .await
        {
            if err.is_not_found() {
                // deleted out of band; forget the id so the next cycle re-creates it
                checkpoint.save(key, result_keys::REMOTE_ID, None).await?;
                return Err(SyncError::remote(
                    op,
                    RemoteError::new(
                        RemoteErrorKind::Unavailable,
                        format!("remote object {id} disappeared: {}", err.message),
                    ),
                ));
            }
            return Err(SyncError::remote(op, err));
        }

        let config_version = self
            .call(op, key, move || client.config_version(id))
            .await
            .map_err(|e| SyncError::remote(op, e))?;
        if let Some(version) = config_version.as_deref() {
            checkpoint
                .save(key, result_keys::CONFIG_VERSION, Some(version))
                .await?;
        }
        Ok(config_version)
    }

    async fn delete_remote(
        &self,
        key: &ExternalResourceKey,
        known_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let client = self.client.as_ref();
        let op = PlanStep::DeleteRemote.name();

        let remote_id = match known_id {
            Some(id) => Some(id.to_string()),
            None => self
                .call(op, key, move || client.exists(key))
                .await
                .map_err(|e| SyncError::remote(op, e))?,
        };

        match remote_id.as_deref() {
            Some(id) => match self.call(op, key, move || client.delete(id)).await {
                Ok(()) => tracing::info!(key = %key, remote_id = id, "remote object deleted"),
                Err(err) if err.is_not_found() => {
                    tracing::debug!(key = %key, remote_id = id, "remote object already gone");
                }
                Err(err) => return Err(SyncError::remote(op, err)),
            },
            None => tracing::debug!(key = %key, "no remote object to delete"),
        }
        Ok(())
    }

    /// One remote call with per-attempt timeout and exponential backoff
    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        key: &ExternalResourceKey,
        f: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let timeout = self.retry.call_timeout();
        let attempt = AtomicU32::new(0);

        let operation = || {
            let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
            let call = f();
            async move {
                metrics::counter!("fragsync_remote_calls_total", "op" => op).increment(1);
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::timeout(format!(
                        "{op} exceeded {}ms",
                        timeout.as_millis()
                    ))),
                };
                result.map_err(|err| {
                    metrics::counter!(
                        "fragsync_remote_failures_total",
                        "op" => op,
                        "kind" => err.kind.as_str()
                    )
                    .increment(1);
                    if err.is_retryable() && n < max_attempts {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        };
        let notify = |err: RemoteError, wait: Duration| {
            tracing::warn!(key = %key, op, error = %err, ?wait, "remote call failed, retrying");
        };

        backoff::future::retry_notify(self.policy(), operation, notify).await
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval())
            .with_max_interval(self.retry.max_interval())
            .with_multiplier(self.retry.multiplier)
            .with_randomization_factor(self.retry.jitter)
            .with_max_elapsed_time(None)
            .build()
    }
}
