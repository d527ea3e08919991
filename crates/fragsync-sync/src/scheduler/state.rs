//! Per-key scheduling state
//!
//! ```text
//!   Idle --trigger--> Queued --dispatch--> Syncing --finish--> Idle
//!                                            |
//!                                            +--finish (re-triggered)--> Queued
//! ```
//!
//! A key is never queued twice and never synced by two workers of the same
//! replica. Triggers that arrive while a key is syncing set a rerun flag so
//! the change is picked up by one more pass.

use crate::error::SyncError;
use dashmap::DashMap;
use fragsync_model::ExternalResourceKey;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Scheduling state of one key on this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyState {
    /// Nothing pending
    #[default]
    Idle,
    /// Waiting for a worker
    Queued,
    /// A worker is running a cycle
    Syncing,
}

/// Validate a state transition
///
/// # Errors
/// [`SyncError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: KeyState, to: KeyState) -> Result<(), SyncError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(SyncError::IllegalTransition { from, to })
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: KeyState) -> Vec<KeyState> {
    use KeyState::{Idle, Queued, Syncing};
    match from {
        Idle => vec![Queued],
        Queued => vec![Syncing],
        Syncing => vec![Idle, Queued],
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    state: KeyState,
    rerun: bool,
}

/// Deduplicating work queue keyed by resource
#[derive(Debug)]
pub struct KeyTracker {
    slots: DashMap<ExternalResourceKey, Slot>,
    deferred: DashMap<ExternalResourceKey, Instant>,
    queue: mpsc::UnboundedSender<ExternalResourceKey>,
}

impl KeyTracker {
    /// Create tracker and the receiving end of its queue
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExternalResourceKey>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            slots: DashMap::new(),
            deferred: DashMap::new(),
            queue,
        };
        (tracker, rx)
    }

    /// Request a cycle for `key`
    ///
    /// Returns true if the key was newly queued.
    pub fn trigger(&self, key: &ExternalResourceKey) -> bool {
        let mut slot = self.slots.entry(key.clone()).or_default();
        match slot.state {
            KeyState::Idle => {
                slot.state = KeyState::Queued;
                drop(slot);
                self.enqueue(key.clone());
                true
            }
            KeyState::Queued => false,
            KeyState::Syncing => {
                slot.rerun = true;
                false
            }
        }
    }

    /// Mark a dequeued key as syncing
    ///
    /// # Errors
    /// [`SyncError::IllegalTransition`] if the key was not queued
    pub fn begin(&self, key: &ExternalResourceKey) -> Result<(), SyncError> {
        let mut slot = self.slots.entry(key.clone()).or_default();
        validate_transition(slot.state, KeyState::Syncing)?;
        slot.state = KeyState::Syncing;
        slot.rerun = false;
        Ok(())
    }

    /// Mark a cycle finished
    ///
    /// Re-queues the key if it was triggered while syncing; returns true in
    /// that case.
    ///
    /// # Errors
    /// [`SyncError::IllegalTransition`] if the key was not syncing
    pub fn finish(&self, key: &ExternalResourceKey) -> Result<bool, SyncError> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Err(SyncError::IllegalTransition {
                from: KeyState::Idle,
                to: KeyState::Idle,
            });
        };
        if slot.rerun {
            validate_transition(slot.state, KeyState::Queued)?;
            slot.state = KeyState::Queued;
            slot.rerun = false;
            drop(slot);
            self.enqueue(key.clone());
            return Ok(true);
        }
        validate_transition(slot.state, KeyState::Idle)?;
        drop(slot);
        self.slots.remove(key);
        Ok(false)
    }

    /// Current state of `key`
    #[must_use]
    pub fn state(&self, key: &ExternalResourceKey) -> KeyState {
        self.slots.get(key).map(|s| s.state).unwrap_or_default()
    }

    /// Keys queued or syncing
    #[must_use]
    pub fn active(&self) -> usize {
        self.slots.len()
    }

    /// Register a delayed trigger at `delay` from now
    ///
    /// Returns the deadline to pass to [`KeyTracker::fire_deferred`], or
    /// `None` if an earlier trigger is already pending.
    pub fn defer(&self, key: &ExternalResourceKey, delay: Duration) -> Option<Instant> {
        let deadline = Instant::now() + delay;
        let mut pending = self.deferred.entry(key.clone()).or_insert(deadline);
        if *pending < deadline {
            return None;
        }
        *pending = deadline;
        Some(deadline)
    }

    /// Fire a delayed trigger registered by [`KeyTracker::defer`]
    pub fn fire_deferred(&self, key: &ExternalResourceKey, deadline: Instant) {
        self.deferred.remove_if(key, |_, at| *at == deadline);
        self.trigger(key);
    }

    fn enqueue(&self, key: ExternalResourceKey) {
        if self.queue.send(key).is_err() {
            tracing::debug!("dispatcher gone, dropping trigger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragsync_model::ResourceType;

    fn key(name: &str) -> ExternalResourceKey {
        ExternalResourceKey::new(ResourceType::DnsRecords, "acct", name)
    }

    #[test]
    fn transition_table() {
        assert!(validate_transition(KeyState::Idle, KeyState::Queued).is_ok());
        assert!(validate_transition(KeyState::Queued, KeyState::Syncing).is_ok());
        assert!(validate_transition(KeyState::Syncing, KeyState::Queued).is_ok());
        assert!(validate_transition(KeyState::Idle, KeyState::Syncing).is_err());
        assert!(validate_transition(KeyState::Queued, KeyState::Idle).is_err());
    }

    #[test]
    fn triggers_coalesce_while_queued() {
        let (tracker, mut rx) = KeyTracker::new();
        assert!(tracker.trigger(&key("a")));
        assert!(!tracker.trigger(&key("a")));
        assert!(tracker.trigger(&key("b")));

        assert_eq!(rx.try_recv().unwrap(), key("a"));
        assert_eq!(rx.try_recv().unwrap(), key("b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn trigger_during_sync_reruns_once() {
        let (tracker, mut rx) = KeyTracker::new();
        tracker.trigger(&key("a"));
        rx.try_recv().unwrap();
        tracker.begin(&key("a")).unwrap();

        assert!(!tracker.trigger(&key("a")));
        assert!(!tracker.trigger(&key("a")));
        assert!(rx.try_recv().is_err());

        assert!(tracker.finish(&key("a")).unwrap());
        assert_eq!(tracker.state(&key("a")), KeyState::Queued);
        assert_eq!(rx.try_recv().unwrap(), key("a"));
        assert!(rx.try_recv().is_err());

        tracker.begin(&key("a")).unwrap();
        assert!(!tracker.finish(&key("a")).unwrap());
        assert_eq!(tracker.state(&key("a")), KeyState::Idle);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn finish_without_begin_is_illegal() {
        let (tracker, _rx) = KeyTracker::new();
        assert!(matches!(
            tracker.finish(&key("a")),
            Err(SyncError::IllegalTransition { .. })
        ));
        tracker.trigger(&key("a"));
        assert!(tracker.finish(&key("a")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn defer_keeps_earliest_deadline() {
        let (tracker, mut rx) = KeyTracker::new();
        let first = tracker.defer(&key("a"), Duration::from_secs(5)).unwrap();
        assert!(tracker.defer(&key("a"), Duration::from_secs(10)).is_none());
        let sooner = tracker.defer(&key("a"), Duration::from_secs(1)).unwrap();
        assert!(sooner < first);

        tracker.fire_deferred(&key("a"), sooner);
        assert_eq!(rx.try_recv().unwrap(), key("a"));
        assert!(tracker.defer(&key("a"), Duration::from_secs(10)).is_some());
    }
}
