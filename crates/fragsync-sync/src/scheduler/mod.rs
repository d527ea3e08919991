//! Sync scheduler
//!
//! Turns store events and periodic sweeps into sync cycles. Keys are
//! deduplicated by [`KeyTracker`], so any number of triggers for one key
//! collapse into at most one queued and one running cycle per replica.
//! Cross-replica single-flight is the claim's job, not the scheduler's.
//!
//! Tasks started by [`SyncScheduler::start`]:
//! - event listener: triggers every key written or deleted in the store
//! - revalidation ticker: re-lists all keys every `revalidation_tick_ms`
//! - dispatcher: runs up to `workers` cycles concurrently
//! - cooldown timers: re-trigger failed keys once their retry is due

mod state;
mod worker;

pub use state::{allowed_transitions, validate_transition, KeyState, KeyTracker};
pub use worker::{CycleOutcome, SyncWorker};

use crate::config::SyncConfig;
use chrono::Utc;
use fragsync_model::ExternalResourceKey;
use fragsync_store::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Drives [`SyncWorker`] cycles for every key in a store
pub struct SyncScheduler {
    worker: Arc<SyncWorker>,
    store: Arc<dyn RecordStore>,
    workers: usize,
    tick: Duration,
    transient_cooldown: Duration,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("workers", &self.workers)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    /// Create scheduler
    #[must_use]
    pub fn new(worker: SyncWorker, store: Arc<dyn RecordStore>, config: &SyncConfig) -> Self {
        Self {
            worker: Arc::new(worker),
            store,
            workers: config.workers.max(1),
            tick: config.revalidation_tick(),
            transient_cooldown: config.transient_cooldown(),
        }
    }

    /// Spawn the scheduler tasks on the current runtime
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (tracker, queue) = KeyTracker::new();
        let tracker = Arc::new(tracker);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events = self.store.subscribe();

        let tasks = vec![
            tokio::spawn(listen(
                events,
                self.store.clone(),
                tracker.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(sweep(
                self.store.clone(),
                tracker.clone(),
                self.tick,
                shutdown_rx.clone(),
            )),
            tokio::spawn(dispatch(
                queue,
                Dispatch {
                    worker: self.worker,
                    tracker: tracker.clone(),
                    permits: Arc::new(Semaphore::new(self.workers)),
                    workers: self.workers,
                    transient_cooldown: self.transient_cooldown,
                    shutdown: shutdown_rx,
                },
            )),
        ];

        tracing::info!(workers = self.workers, tick = ?self.tick, "scheduler started");
        SchedulerHandle {
            tracker,
            shutdown,
            tasks,
        }
    }
}

/// Control handle for a running scheduler
#[derive(Debug)]
pub struct SchedulerHandle {
    tracker: Arc<KeyTracker>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Queue a cycle for `key`; returns false if one is already pending
    pub fn trigger(&self, key: &ExternalResourceKey) -> bool {
        self.tracker.trigger(key)
    }

    /// Scheduling state of `key` on this replica
    #[must_use]
    pub fn state(&self, key: &ExternalResourceKey) -> KeyState {
        self.tracker.state(key)
    }

    /// Stop accepting work and wait for running cycles to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "scheduler task panicked");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

async fn listen(
    mut events: broadcast::Receiver<fragsync_store::StoreEvent>,
    store: Arc<dyn RecordStore>,
    tracker: Arc<KeyTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    tracker.trigger(event.key());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "store events lagged, re-listing keys");
                    trigger_all(store.as_ref(), &tracker).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn sweep(
    store: Arc<dyn RecordStore>,
    tracker: Arc<KeyTracker>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => trigger_all(store.as_ref(), &tracker).await,
        }
    }
}

async fn trigger_all(store: &dyn RecordStore, tracker: &KeyTracker) {
    match store.list_keys().await {
        Ok(keys) => {
            let queued = keys.iter().filter(|key| tracker.trigger(key)).count();
            tracing::debug!(keys = keys.len(), queued, "sweep");
        }
        Err(err) => tracing::error!(error = %err, "failed to list keys"),
    }
}

struct Dispatch {
    worker: Arc<SyncWorker>,
    tracker: Arc<KeyTracker>,
    permits: Arc<Semaphore>,
    workers: usize,
    transient_cooldown: Duration,
    shutdown: watch::Receiver<bool>,
}

async fn dispatch(mut queue: mpsc::UnboundedReceiver<ExternalResourceKey>, mut ctx: Dispatch) {
    loop {
        let key = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            key = queue.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            permit = ctx.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if let Err(err) = ctx.tracker.begin(&key) {
            tracing::error!(key = %key, error = %err, "dequeued key in wrong state");
            continue;
        }

        let worker = ctx.worker.clone();
        let tracker = ctx.tracker.clone();
        let shutdown = ctx.shutdown.clone();
        let transient_cooldown = ctx.transient_cooldown;
        tokio::spawn(async move {
            let started = Instant::now();
            let retry_after = match worker.run_cycle(&key).await {
                Ok(outcome) => {
                    metrics::counter!("fragsync_sync_cycles_total", "outcome" => outcome.as_str())
                        .increment(1);
                    tracing::debug!(key = %key, outcome = outcome.as_str(), "cycle finished");
                    match outcome {
                        CycleOutcome::Failed { retry_after, .. } => Some(retry_after),
                        CycleOutcome::CoolingDown { until: Some(until) } => {
                            Some((until - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        }
                        _ => None,
                    }
                }
                Err(err) => {
                    metrics::counter!("fragsync_sync_cycles_total", "outcome" => "error")
                        .increment(1);
                    tracing::error!(key = %key, error = %err, "cycle aborted");
                    Some(transient_cooldown)
                }
            };
            metrics::histogram!("fragsync_sync_cycle_seconds")
                .record(started.elapsed().as_secs_f64());

            if let Some(delay) = retry_after {
                defer(&tracker, &key, delay, shutdown);
            }
            if let Err(err) = tracker.finish(&key) {
                tracing::error!(key = %key, error = %err, "finished key in wrong state");
            }
            drop(permit);
        });
    }

    // wait for in-flight cycles
    let workers = u32::try_from(ctx.workers).unwrap_or(u32::MAX);
    let _ = ctx.permits.acquire_many(workers).await;
}

fn defer(
    tracker: &Arc<KeyTracker>,
    key: &ExternalResourceKey,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(deadline) = tracker.defer(key, delay) else {
        return;
    };
    let tracker = tracker.clone();
    let key = key.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep_until(deadline) => tracker.fire_deferred(&key, deadline),
        }
    });
}
