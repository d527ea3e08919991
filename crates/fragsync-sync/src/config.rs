//! Aggregator configuration
//!
//! Loaded from TOML; every field has a default so a partial file is enough.

use fragsync_store::ConflictRetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for [`SyncConfig`]
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

/// Aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity of this replica in claims
    pub replica_id: String,
    /// Concurrent sync workers
    pub workers: usize,
    /// Claim lease in seconds
    pub claim_lease_secs: u64,
    /// Maximum age of a successful sync before drift correction
    pub revalidation_interval_secs: u64,
    /// How often the revalidation ticker re-lists every key, in milliseconds
    pub revalidation_tick_ms: u64,
    /// Re-queue delay after a transient failure, in milliseconds
    pub transient_cooldown_ms: u64,
    /// Re-queue delay after a permanent failure, in milliseconds
    pub permanent_cooldown_ms: u64,
    /// Remote call retry
    pub remote: RemoteRetryConfig,
    /// Conditional-write retry
    pub conflict: ConflictRetryConfig,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    ///
    /// # Errors
    /// Returns error on malformed TOML or out-of-range values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    ///
    /// # Errors
    /// Returns error if the file is unreadable or invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the scheduler cannot run with
    ///
    /// Remote step duration is not bounded by the lease: the claim is renewed
    /// every third of a lease while steps run. What must fit is one renewal,
    /// whose worst case is the conditional-write retry budget, inside the
    /// two thirds of a lease left after it starts.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.replica_id.trim().is_empty() {
            return invalid("replica_id", "must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers", "must be at least 1");
        }
        if self.claim_lease_secs == 0 {
            return invalid("claim_lease_secs", "must be at least 1");
        }
        if self.revalidation_tick_ms == 0 {
            return invalid("revalidation_tick_ms", "must be at least 1");
        }
        if self.remote.max_attempts == 0 {
            return invalid("remote.max_attempts", "must be at least 1");
        }
        if self.remote.call_timeout_ms == 0 {
            return invalid("remote.call_timeout_ms", "must be at least 1");
        }
        if self.remote.multiplier < 1.0 {
            return invalid("remote.multiplier", "must be >= 1.0");
        }
        if self.conflict.max_attempts == 0 {
            return invalid("conflict.max_attempts", "must be at least 1");
        }
        let renewal_ms =
            u64::from(self.conflict.max_attempts).saturating_mul(self.conflict.max_delay_ms);
        if renewal_ms.saturating_mul(3) >= self.claim_lease_secs.saturating_mul(2_000) {
            return Err(ConfigError::Invalid {
                field: "claim_lease_secs",
                reason: format!(
                    "a claim renewal may take {renewal_ms}ms of write retries, \
                     more than two thirds of the {}s lease",
                    self.claim_lease_secs
                ),
            });
        }
        Ok(())
    }

    /// With replica identity
    #[inline]
    #[must_use]
    pub fn with_replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.replica_id = replica_id.into();
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// With claim lease
    #[inline]
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease_secs = lease.as_secs().max(1);
        self
    }

    /// With revalidation interval
    #[inline]
    #[must_use]
    pub fn with_revalidation_interval(mut self, interval: Duration) -> Self {
        self.revalidation_interval_secs = interval.as_secs();
        self
    }

    /// With revalidation ticker period
    #[inline]
    #[must_use]
    pub fn with_revalidation_tick(mut self, tick: Duration) -> Self {
        self.revalidation_tick_ms = millis(tick).max(1);
        self
    }

    /// With error cooldowns
    #[inline]
    #[must_use]
    pub fn with_cooldowns(mut self, transient: Duration, permanent: Duration) -> Self {
        self.transient_cooldown_ms = millis(transient);
        self.permanent_cooldown_ms = millis(permanent);
        self
    }

    /// With remote retry settings
    #[inline]
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteRetryConfig) -> Self {
        self.remote = remote;
        self
    }

    /// With conditional-write retry settings
    #[inline]
    #[must_use]
    pub fn with_conflict(mut self, conflict: ConflictRetryConfig) -> Self {
        self.conflict = conflict;
        self
    }

    /// Claim lease
    #[inline]
    #[must_use]
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    /// Revalidation interval
    #[inline]
    #[must_use]
    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_secs)
    }

    /// Revalidation ticker period
    #[inline]
    #[must_use]
    pub fn revalidation_tick(&self) -> Duration {
        Duration::from_millis(self.revalidation_tick_ms)
    }

    /// Transient error cooldown
    #[inline]
    #[must_use]
    pub fn transient_cooldown(&self) -> Duration {
        Duration::from_millis(self.transient_cooldown_ms)
    }

    /// Permanent error cooldown
    #[inline]
    #[must_use]
    pub fn permanent_cooldown(&self) -> Duration {
        Duration::from_millis(self.permanent_cooldown_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replica_id: format!("fragsync-{}", uuid::Uuid::new_v4().simple()),
            workers: 4,
            claim_lease_secs: 120,
            revalidation_interval_secs: 3600,
            revalidation_tick_ms: 300_000,
            transient_cooldown_ms: 30_000,
            permanent_cooldown_ms: 600_000,
            remote: RemoteRetryConfig::default(),
            conflict: ConflictRetryConfig::default(),
        }
    }
}

/// Retry and timeout for remote API calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteRetryConfig {
    /// Attempts per call within one cycle, including the first
    pub max_attempts: u32,
    /// First backoff interval in milliseconds
    pub initial_interval_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_interval_ms: u64,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Randomization applied to each interval (0.0 to 1.0)
    pub jitter: f64,
    /// Per-call deadline in milliseconds
    pub call_timeout_ms: u64,
}

impl RemoteRetryConfig {
    /// With attempt bound
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// With backoff intervals
    #[inline]
    #[must_use]
    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval_ms = millis(initial);
        self.max_interval_ms = millis(max);
        self
    }

    /// With per-call deadline
    #[inline]
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = millis(timeout);
        self
    }

    /// Per-call deadline
    #[inline]
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// First backoff interval
    #[inline]
    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    /// Backoff ceiling
    #[inline]
    #[must_use]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

impl Default for RemoteRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 200,
            max_interval_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.5,
            call_timeout_ms: 30_000,
        }
    }
}

/// Conditional-write retry, see [`ConflictRetryPolicy`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictRetryConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Backoff base in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

impl ConflictRetryConfig {
    /// Build the store's retry policy
    #[must_use]
    pub fn policy(&self) -> ConflictRetryPolicy {
        ConflictRetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        let policy = ConflictRetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: millis(policy.base_delay),
            max_delay_ms: millis(policy.max_delay),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert!(config.replica_id.starts_with("fragsync-"));
        assert_eq!(config.conflict.policy(), ConflictRetryPolicy::default());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            replica_id = "replica-a"
            workers = 8

            [remote]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.replica_id, "replica-a");
        assert_eq!(config.workers, 8);
        assert_eq!(config.remote.max_attempts, 3);
        assert_eq!(config.remote.call_timeout_ms, 30_000);
        assert_eq!(config.permanent_cooldown(), Duration::from_secs(600));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = SyncConfig::from_toml_str("workers = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "workers", .. }));
    }

    #[test]
    fn lease_must_outlast_a_renewal() {
        let err = SyncConfig::from_toml_str(
            r#"
            claim_lease_secs = 1

            [conflict]
            max_attempts = 10
            max_delay_ms = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "claim_lease_secs",
                ..
            }
        ));

        // slow remote steps are fine: the lease is renewed while they run
        SyncConfig::default()
            .with_claim_lease(Duration::from_secs(2))
            .with_remote(
                RemoteRetryConfig::default()
                    .with_max_attempts(10)
                    .with_call_timeout(Duration::from_secs(60)),
            )
            .validate()
            .unwrap();
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(matches!(
            SyncConfig::from_toml_str("workers = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SyncConfig::load("/nonexistent/fragsync.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fragsync.toml"));
    }

    #[test]
    fn builders() {
        let config = SyncConfig::new()
            .with_replica_id("r1")
            .with_workers(2)
            .with_claim_lease(Duration::from_secs(10))
            .with_cooldowns(Duration::from_secs(1), Duration::from_secs(5))
            .with_remote(RemoteRetryConfig::default().with_max_attempts(2));
        assert_eq!(config.claim_lease(), Duration::from_secs(10));
        assert_eq!(config.transient_cooldown(), Duration::from_secs(1));
        assert_eq!(config.remote.max_attempts, 2);
    }
}
