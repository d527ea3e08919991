//! Store error types

use fragsync_model::{ExternalResourceKey, RevisionToken};

/// Persistence failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Conditional write lost a race: the stored revision moved on
    #[error("revision conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Record key
        key: String,
        /// Revision the writer read
        expected: Option<RevisionToken>,
        /// Revision actually stored
        actual: Option<RevisionToken>,
    },

    /// Record does not exist
    #[error("record not found: {0}")]
    NotFound(String),

    /// Read-modify-write retries ran out
    #[error("gave up on {key} after {attempts} conflicting writes")]
    ContentionExhausted {
        /// Record key
        key: String,
        /// Attempts made
        attempts: u32,
    },

    /// Record passed for a different key than the one addressed
    #[error("record for {record} written under {key}")]
    KeyMismatch {
        /// Addressed key
        key: String,
        /// Key carried by the record
        record: String,
    },

    /// Substrate failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a conflict error
    #[inline]
    #[must_use]
    pub fn conflict(
        key: &ExternalResourceKey,
        expected: Option<RevisionToken>,
        actual: Option<RevisionToken>,
    ) -> Self {
        Self::Conflict {
            key: key.to_string(),
            expected,
            actual,
        }
    }

    /// Create a not-found error
    #[inline]
    #[must_use]
    pub fn not_found(key: &ExternalResourceKey) -> Self {
        Self::NotFound(key.to_string())
    }

    /// True for a lost conditional write
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True if the caller may simply re-invoke the operation
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::ContentionExhausted { .. } | Self::Backend(_)
        )
    }
}
