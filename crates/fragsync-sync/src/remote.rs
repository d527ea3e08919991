//! Remote API client interface
//!
//! The client only maps calls onto the remote API. Retries, timeouts and
//! checkpointing belong to the executor, so every method must be safe to call
//! again after any failure.

use async_trait::async_trait;
use fragsync_model::ExternalResourceKey;
use serde_json::Value as JsonValue;
use std::fmt;

/// Failure category reported by a remote client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// Call did not finish within its deadline
    Timeout,
    /// Connection-level failure
    Network,
    /// Throttled by the remote API
    RateLimited,
    /// Remote returned a server error (5xx)
    Unavailable,
    /// Credentials rejected
    Unauthorized,
    /// Request rejected as malformed
    Invalid,
    /// Remote state conflicts with the request
    Conflict,
    /// Remote object does not exist
    NotFound,
}

impl RemoteErrorKind {
    /// True for failures worth retrying with backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimited | Self::Unavailable
        )
    }

    /// Lowercase label for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Unauthorized => "unauthorized",
            Self::Invalid => "invalid",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote call failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Category
    pub kind: RemoteErrorKind,
    /// Detail from the remote API
    pub message: String,
}

impl RemoteError {
    /// Create a remote error
    #[inline]
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Deadline exceeded
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    /// Remote server error
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    /// Object missing
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    /// True for failures worth retrying with backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// True if the remote object does not exist
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

/// Remote API operations the executor drives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// Look up the remote object for `key`, returning its id if present
    async fn exists(&self, key: &ExternalResourceKey) -> Result<Option<String>, RemoteError>;

    /// Create the remote object, returning its id
    async fn create(
        &self,
        key: &ExternalResourceKey,
        document: &JsonValue,
    ) -> Result<String, RemoteError>;

    /// Replace the configuration body of an existing object
    async fn update(&self, remote_id: &str, document: &JsonValue) -> Result<(), RemoteError>;

    /// Delete the remote object
    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError>;

    /// Remote-side version after the last update, if the API exposes one
    async fn config_version(&self, _remote_id: &str) -> Result<Option<String>, RemoteError> {
        Ok(None)
    }
}
