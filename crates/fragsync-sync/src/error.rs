//! Sync error types
//!
//! Three classes matter to the scheduler: contention (lost write races),
//! transient remote failures and permanent ones. Merge ambiguity is never an
//! error; only structurally broken payloads are.

use crate::config::ConfigError;
use crate::remote::RemoteError;
use crate::scheduler::KeyState;
use fragsync_merge::MergeError;
use fragsync_model::ErrorClass;
use fragsync_store::StoreError;

/// Errors raised while syncing one resource
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Persistence failure, including exhausted write contention
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Fragment payloads contradict the merge schema
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    /// Remote call failed after retries
    #[error("remote {op} failed: {source}")]
    Remote {
        /// Operation name
        op: &'static str,
        /// Last failure
        source: RemoteError,
    },

    /// Another replica owns the claim now
    #[error("claim on {key} lost")]
    ClaimLost {
        /// Record key
        key: String,
    },

    /// Scheduler state machine violation
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State before
        from: KeyState,
        /// Requested state
        to: KeyState,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Wrap a remote failure with the operation that raised it
    #[inline]
    #[must_use]
    pub fn remote(op: &'static str, source: RemoteError) -> Self {
        Self::Remote { op, source }
    }

    /// Classification recorded in the status
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(StoreError::Conflict { .. } | StoreError::ContentionExhausted { .. })
            | Self::ClaimLost { .. } => ErrorClass::Conflict,
            Self::Store(_) => ErrorClass::Transient,
            Self::Remote { source, .. } if source.is_retryable() => ErrorClass::Transient,
            Self::Remote { .. }
            | Self::Merge(_)
            | Self::IllegalTransition { .. }
            | Self::Config(_) => ErrorClass::Permanent,
        }
    }

    /// True unless an operator or a producer must fix something first
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }
}
