//! Change detection
//!
//! Decides whether a record needs remote work by comparing the hash of the
//! current merge with the last successfully synced hash.

use chrono::{DateTime, Duration, Utc};
use fragsync_merge::MergedDocument;
use fragsync_model::{AggregationRecord, ContentHash, SyncPhase};
use std::fmt;

/// Why a record does (or does not) need a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncReason {
    /// Merged document differs from the last synced one
    ConfigChanged,
    /// Last attempt failed and its cooldown has passed
    PriorError,
    /// Last successful sync is older than the revalidation interval
    Revalidation,
    /// Operator asked for a re-sync
    ResyncRequested,
    /// A replica stopped mid-sync and its claim expired
    Interrupted,
    /// Last fragment withdrawn; the remote object must be deleted
    Teardown,
    /// Failed attempt still cooling down; nothing changed since
    CoolingDown,
    /// Remote state is current
    UpToDate,
}

impl SyncReason {
    /// Lowercase label for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigChanged => "config_changed",
            Self::PriorError => "prior_error",
            Self::Revalidation => "revalidation",
            Self::ResyncRequested => "resync_requested",
            Self::Interrupted => "interrupted",
            Self::Teardown => "teardown",
            Self::CoolingDown => "cooling_down",
            Self::UpToDate => "up_to_date",
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`ChangeDetector::needs_sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    /// Why
    pub reason: SyncReason,
}

impl SyncDecision {
    /// True if the executor should run
    #[inline]
    #[must_use]
    pub fn should_sync(&self) -> bool {
        !matches!(self.reason, SyncReason::UpToDate | SyncReason::CoolingDown)
    }

    /// True for the teardown path
    #[inline]
    #[must_use]
    pub fn is_teardown(&self) -> bool {
        self.reason == SyncReason::Teardown
    }
}

/// Compares current merges against recorded sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetector {
    revalidation_interval: Option<Duration>,
}

impl ChangeDetector {
    /// Create detector; `None` disables periodic revalidation
    #[inline]
    #[must_use]
    pub fn new(revalidation_interval: Option<std::time::Duration>) -> Self {
        Self {
            revalidation_interval: revalidation_interval
                .filter(|d| !d.is_zero())
                .and_then(|d| Duration::from_std(d).ok()),
        }
    }

    /// Canonical hash of a merged document
    #[inline]
    #[must_use]
    pub fn hash(document: &MergedDocument) -> ContentHash {
        document.hash()
    }

    /// Decide whether `record` needs remote work
    ///
    /// `current` is the hash of the record's current merge, `None` if the
    /// merge failed.
    #[must_use]
    pub fn needs_sync(
        &self,
        record: &AggregationRecord,
        current: Option<&ContentHash>,
        now: DateTime<Utc>,
    ) -> SyncDecision {
        let status = &record.status;
        let cooling = status.is_error() && status.next_retry_at.is_some_and(|at| now < at);

        let reason = if record.teardown_requested && record.is_empty() {
            if cooling && !record.resync_requested {
                SyncReason::CoolingDown
            } else {
                SyncReason::Teardown
            }
        } else if record.is_empty() {
            SyncReason::UpToDate
        } else if record.resync_requested {
            SyncReason::ResyncRequested
        } else if status.is_error() {
            // Cooldown only holds while the fragments match the failed attempt.
            if status.attempted_hash.as_ref() != current {
                SyncReason::ConfigChanged
            } else if cooling {
                SyncReason::CoolingDown
            } else {
                SyncReason::PriorError
            }
        } else if status.phase == SyncPhase::Syncing && !record.has_live_claim(now) {
            SyncReason::Interrupted
        } else if current.is_none() || status.config_hash.as_ref() != current {
            SyncReason::ConfigChanged
        } else if self.revalidation_due(record, now) {
            SyncReason::Revalidation
        } else {
            SyncReason::UpToDate
        };

        SyncDecision { reason }
    }

    fn revalidation_due(&self, record: &AggregationRecord, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.revalidation_interval else {
            return false;
        };
        record
            .status
            .last_sync_time
            .map_or(true, |last| now - last >= interval)
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(Some(std::time::Duration::from_secs(3600)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragsync_model::{ConfigFragment, ExternalResourceKey, ResourceType, SourceRef};
    use serde_json::json;

    fn record_with_fragment() -> AggregationRecord {
        let mut record = AggregationRecord::new(ExternalResourceKey::new(
            ResourceType::TunnelConfig,
            "acct",
            "tun",
        ));
        record.upsert_fragment(ConfigFragment::new(
            SourceRef::new("Tunnel", "ns", "a"),
            json!({"loglevel": "info"}),
            1,
        ));
        record
    }

    fn synced(record: &mut AggregationRecord, hash: ContentHash, at: DateTime<Utc>) {
        record.status.phase = SyncPhase::Synced;
        record.status.config_hash = Some(hash);
        record.status.last_sync_time = Some(at);
    }

    fn hash(n: u8) -> ContentHash {
        ContentHash::compute(&[n])
    }

    #[test]
    fn never_synced_needs_sync() {
        let detector = ChangeDetector::default();
        let decision = detector.needs_sync(&record_with_fragment(), Some(&hash(1)), Utc::now());
        assert_eq!(decision.reason, SyncReason::ConfigChanged);
        assert!(decision.should_sync());
    }

    #[test]
    fn unchanged_hash_is_up_to_date() {
        let detector = ChangeDetector::default();
        let now = Utc::now();
        let mut record = record_with_fragment();
        synced(&mut record, hash(1), now);

        let decision = detector.needs_sync(&record, Some(&hash(1)), now);
        assert_eq!(decision.reason, SyncReason::UpToDate);
        assert!(!decision.should_sync());

        let decision = detector.needs_sync(&record, Some(&hash(2)), now);
        assert_eq!(decision.reason, SyncReason::ConfigChanged);
    }

    #[test]
    fn stale_sync_is_revalidated() {
        let detector = ChangeDetector::new(Some(std::time::Duration::from_secs(60)));
        let now = Utc::now();
        let mut record = record_with_fragment();
        synced(&mut record, hash(1), now - Duration::seconds(61));
        assert_eq!(
            detector.needs_sync(&record, Some(&hash(1)), now).reason,
            SyncReason::Revalidation
        );

        let disabled = ChangeDetector::new(None);
        assert_eq!(
            disabled.needs_sync(&record, Some(&hash(1)), now).reason,
            SyncReason::UpToDate
        );
    }

    #[test]
    fn errored_record_cools_down_then_retries() {
        let detector = ChangeDetector::default();
        let now = Utc::now();
        let mut record = record_with_fragment();
        record.status.phase = SyncPhase::Error;
        record.status.attempted_hash = Some(hash(1));
        record.status.next_retry_at = Some(now + Duration::seconds(30));

        assert_eq!(
            detector.needs_sync(&record, Some(&hash(1)), now).reason,
            SyncReason::CoolingDown
        );
        assert_eq!(
            detector
                .needs_sync(&record, Some(&hash(1)), now + Duration::seconds(31))
                .reason,
            SyncReason::PriorError
        );
        // a producer fixed its fragment: retry at once
        assert_eq!(
            detector.needs_sync(&record, Some(&hash(2)), now).reason,
            SyncReason::ConfigChanged
        );
    }

    #[test]
    fn resync_overrides_up_to_date() {
        let detector = ChangeDetector::default();
        let now = Utc::now();
        let mut record = record_with_fragment();
        synced(&mut record, hash(1), now);
        record.resync_requested = true;
        assert_eq!(
            detector.needs_sync(&record, Some(&hash(1)), now).reason,
            SyncReason::ResyncRequested
        );
    }

    #[test]
    fn empty_record_with_teardown_flag() {
        let detector = ChangeDetector::default();
        let mut record = AggregationRecord::new(ExternalResourceKey::new(
            ResourceType::DnsRecords,
            "acct",
            "zone",
        ));
        assert_eq!(
            detector.needs_sync(&record, None, Utc::now()).reason,
            SyncReason::UpToDate
        );
        record.teardown_requested = true;
        let decision = detector.needs_sync(&record, None, Utc::now());
        assert!(decision.is_teardown());
        assert!(decision.should_sync());
    }

    #[test]
    fn abandoned_sync_is_resumed() {
        let detector = ChangeDetector::default();
        let now = Utc::now();
        let mut record = record_with_fragment();
        synced(&mut record, hash(1), now);
        record.status.phase = SyncPhase::Syncing;
        record.claim = Some(fragsync_model::SyncClaim {
            holder: "replica-a".to_string(),
            acquired_at: now - Duration::seconds(300),
            expires_at: now - Duration::seconds(180),
        });
        assert_eq!(
            detector.needs_sync(&record, Some(&hash(1)), now).reason,
            SyncReason::Interrupted
        );
    }

    #[test]
    fn merge_failure_counts_as_changed() {
        let detector = ChangeDetector::default();
        let now = Utc::now();
        let mut record = record_with_fragment();
        synced(&mut record, hash(1), now);
        assert_eq!(
            detector.needs_sync(&record, None, now).reason,
            SyncReason::ConfigChanged
        );
    }
}
