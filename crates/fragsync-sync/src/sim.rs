//! Simulator
//!
//! Drives concurrent producers against the in-memory store and a
//! fault-injecting remote, syncs until the system settles, then checks:
//! - every live key is `Synced` and the remote object holds its merge
//! - every producer's contribution survived contention
//! - no key owns more than one remote object
//! - withdrawn keys are gone both remotely and locally

use crate::aggregator::Aggregator;
use crate::config::{ConflictRetryConfig, RemoteRetryConfig, SyncConfig};
use crate::error::SyncError;
use crate::remote::{RemoteClient, RemoteError, RemoteErrorKind};
use crate::scheduler::CycleOutcome;
use async_trait::async_trait;
use fragsync_model::{ContentHash, ExternalResourceKey, ResourceType, SourceRef, SyncPhase};
use fragsync_store::{InMemoryRecordStore, StoreError};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Fault rates for [`SimulatedRemote`], each in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FaultProfile {
    /// Calls failing with a retryable error
    pub transient_rate: f64,
    /// Calls rejected as invalid
    pub permanent_rate: f64,
    /// Creates and updates applied remotely but reported as timed out
    pub lost_response_rate: f64,
}

/// Remote calls seen by [`SimulatedRemote`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CallCounts {
    /// `exists` calls
    pub exists: u64,
    /// `create` calls
    pub create: u64,
    /// `update` calls
    pub update: u64,
    /// `delete` calls
    pub delete: u64,
    /// Calls that returned an injected failure
    pub injected_failures: u64,
}

impl CallCounts {
    /// All calls
    #[must_use]
    pub fn total(&self) -> u64 {
        self.exists + self.create + self.update + self.delete
    }
}

/// One object held by [`SimulatedRemote`]
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    /// Owning key in storage form
    pub key: String,
    /// Last document written
    pub document: JsonValue,
    /// Bumped on every update
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Transient,
    Permanent,
    LostResponse,
}

#[derive(Debug)]
struct RemoteState {
    rng: StdRng,
    faults: FaultProfile,
    objects: BTreeMap<String, RemoteObject>,
    by_key: HashMap<String, String>,
    next_id: u64,
    calls: CallCounts,
}

impl RemoteState {
    fn roll(&mut self, mutating: bool) -> Option<Fault> {
        let roll: f64 = self.rng.gen();
        let faults = self.faults;
        let fault = if roll < faults.transient_rate {
            Some(Fault::Transient)
        } else if roll < faults.transient_rate + faults.permanent_rate {
            Some(Fault::Permanent)
        } else if mutating
            && roll < faults.transient_rate + faults.permanent_rate + faults.lost_response_rate
        {
            Some(Fault::LostResponse)
        } else {
            None
        };
        if fault.is_some() {
            self.calls.injected_failures += 1;
        }
        fault
    }
}

fn injected(fault: Fault, op: &str) -> RemoteError {
    match fault {
        Fault::Transient => RemoteError::new(RemoteErrorKind::RateLimited, format!("{op}: 429")),
        Fault::Permanent => RemoteError::new(RemoteErrorKind::Invalid, format!("{op}: rejected")),
        Fault::LostResponse => RemoteError::timeout(format!("{op}: response lost")),
    }
}

/// In-memory remote API with seeded fault injection
#[derive(Debug)]
pub struct SimulatedRemote {
    state: Mutex<RemoteState>,
}

impl SimulatedRemote {
    /// Create remote with the given seed and fault rates
    #[must_use]
    pub fn new(seed: u64, faults: FaultProfile) -> Self {
        Self {
            state: Mutex::new(RemoteState {
                rng: StdRng::seed_from_u64(seed),
                faults,
                objects: BTreeMap::new(),
                by_key: HashMap::new(),
                next_id: 1,
                calls: CallCounts::default(),
            }),
        }
    }

    /// Remote that never fails
    #[must_use]
    pub fn reliable() -> Self {
        Self::new(0, FaultProfile::default())
    }

    /// Change fault rates
    pub fn set_faults(&self, faults: FaultProfile) {
        self.state.lock().faults = faults;
    }

    /// Calls so far
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Object owned by `key`
    #[must_use]
    pub fn object_for(&self, key: &ExternalResourceKey) -> Option<RemoteObject> {
        let state = self.state.lock();
        let id = state.by_key.get(&key.storage_key())?;
        state.objects.get(id).cloned()
    }

    /// Number of live objects
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }
}

#[async_trait]
impl RemoteClient for SimulatedRemote {
    async fn exists(&self, key: &ExternalResourceKey) -> Result<Option<String>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.exists += 1;
        if let Some(fault) = state.roll(false) {
            return Err(injected(fault, "exists"));
        }
        Ok(state.by_key.get(&key.storage_key()).cloned())
    }

    async fn create(
        &self,
        key: &ExternalResourceKey,
        document: &JsonValue,
    ) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        state.calls.create += 1;
        let lost = match state.roll(true) {
            Some(Fault::LostResponse) => true,
            Some(fault) => return Err(injected(fault, "create")),
            None => false,
        };
        let storage_key = key.storage_key();
        if state.by_key.contains_key(&storage_key) {
            return Err(RemoteError::new(
                RemoteErrorKind::Conflict,
                format!("{storage_key} already exists"),
            ));
        }
        let id = format!("obj-{}", state.next_id);
        state.next_id += 1;
        state.by_key.insert(storage_key.clone(), id.clone());
        state.objects.insert(
            id.clone(),
            RemoteObject {
                key: storage_key,
                document: document.clone(),
                version: 1,
            },
        );
        if lost {
            return Err(injected(Fault::LostResponse, "create"));
        }
        Ok(id)
    }

    async fn update(&self, remote_id: &str, document: &JsonValue) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.update += 1;
        let lost = match state.roll(true) {
            Some(Fault::LostResponse) => true,
            Some(fault) => return Err(injected(fault, "update")),
            None => false,
        };
        let Some(object) = state.objects.get_mut(remote_id) else {
            return Err(RemoteError::not_found(format!("{remote_id} not found")));
        };
        object.document = document.clone();
        object.version += 1;
        if lost {
            return Err(injected(Fault::LostResponse, "update"));
        }
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.delete += 1;
        if let Some(fault) = state.roll(false) {
            return Err(injected(fault, "delete"));
        }
        let Some(object) = state.objects.remove(remote_id) else {
            return Err(RemoteError::not_found(format!("{remote_id} not found")));
        };
        state.by_key.remove(&object.key);
        Ok(())
    }

    async fn config_version(&self, remote_id: &str) -> Result<Option<String>, RemoteError> {
        let state = self.state.lock();
        Ok(state
            .objects
            .get(remote_id)
            .map(|object| object.version.to_string()))
    }
}

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Resource keys
    pub keys: usize,
    /// Producers contributing to every key
    pub producers_per_key: usize,
    /// Contributions per producer
    pub rounds: usize,
    /// Keys whose producers all withdraw after the first sync
    pub teardown_keys: usize,
    /// Remote fault rates
    pub faults: FaultProfile,
    /// Upper bound on sync passes before giving up
    pub max_passes: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            keys: 8,
            producers_per_key: 4,
            rounds: 3,
            teardown_keys: 2,
            faults: FaultProfile {
                transient_rate: 0.2,
                permanent_rate: 0.02,
                lost_response_rate: 0.05,
            },
            max_passes: 50,
        }
    }
}

/// A broken invariant found by the simulator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Producer gave up on contention
    ProducerFailed {
        /// Producer
        source: String,
        /// Last error
        error: String,
    },
    /// Key did not settle in `Synced`
    NotSynced {
        /// Key
        key: String,
        /// Final phase
        phase: String,
    },
    /// Remote document differs from the recorded merge
    RemoteMismatch {
        /// Key
        key: String,
    },
    /// `config_hash` does not match the recorded merge
    HashMismatch {
        /// Key
        key: String,
    },
    /// A producer's ingress rule is missing from the merge
    LostContribution {
        /// Key
        key: String,
        /// Missing hostname
        hostname: String,
    },
    /// Withdrawn key still present
    TeardownIncomplete {
        /// Key
        key: String,
        /// Remote object still exists
        remote: bool,
        /// Record still exists
        record: bool,
    },
    /// More remote objects than live keys
    DuplicateRemote {
        /// Live keys
        expected: usize,
        /// Remote objects
        actual: usize,
    },
}

/// Counters collected during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    /// Fragment writes by producers
    pub contributions: u64,
    /// Producer retries after exhausted contention
    pub producer_retries: u64,
    /// Sync passes over all keys
    pub passes: usize,
    /// Cycle outcomes by label
    pub outcomes: BTreeMap<String, u64>,
    /// Remote calls
    pub remote: CallCounts,
}

/// Simulator result
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Configuration used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Invariant violations
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// True if no invariant was violated
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== fragsync simulator ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(
            report,
            "Keys: {} ({} torn down)",
            self.config.keys, self.config.teardown_keys
        );
        let _ = writeln!(report, "Producers per key: {}", self.config.producers_per_key);
        let _ = writeln!(report, "Contributions: {}", self.stats.contributions);
        let _ = writeln!(report, "Producer retries: {}", self.stats.producer_retries);
        let _ = writeln!(report, "Sync passes: {}", self.stats.passes);
        for (outcome, count) in &self.stats.outcomes {
            let _ = writeln!(report, "  {outcome}: {count}");
        }
        let remote = &self.stats.remote;
        let _ = writeln!(
            report,
            "Remote calls: {} (exists {}, create {}, update {}, delete {}), injected failures: {}",
            remote.total(),
            remote.exists,
            remote.create,
            remote.update,
            remote.delete,
            remote.injected_failures
        );
        let _ = writeln!(report, "Violations: {}", self.violations.len());
        for (i, violation) in self.violations.iter().enumerate() {
            let _ = writeln!(report, "{}. {violation:?}", i + 1);
        }
        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

fn sim_key(index: usize) -> ExternalResourceKey {
    ExternalResourceKey::new(ResourceType::TunnelConfig, "sim-account", format!("tunnel-{index}"))
}

fn producer_source(key: usize, producer: usize) -> SourceRef {
    SourceRef::new("Ingress", format!("ns-{key}"), format!("route-{producer}"))
}

fn hostname(key: usize, producer: usize) -> String {
    format!("p{producer}.k{key}.example.com")
}

fn payload(key: usize, producer: usize, round: usize) -> JsonValue {
    json!({
        "loglevel": if producer == 0 { "info" } else { "debug" },
        "ingress": [{
            "hostname": hostname(key, producer),
            "service": format!("http://svc-{producer}:{}", 8000 + round),
        }],
        "tags": ["sim", format!("p{producer}")],
    })
}

/// Run the simulator
///
/// # Errors
/// Store failures outside contention, which the in-memory store never raises
pub async fn run_simulation(config: SimulatorConfig) -> Result<SimulatorReport, SyncError> {
    let store = Arc::new(InMemoryRecordStore::new());
    let remote = Arc::new(SimulatedRemote::new(config.seed, config.faults));
    let sync_config = SyncConfig::default()
        .with_replica_id("fragsync-sim")
        .with_cooldowns(Duration::ZERO, Duration::ZERO)
        .with_remote(
            RemoteRetryConfig::default()
                .with_max_attempts(3)
                .with_intervals(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_conflict(ConflictRetryConfig {
            max_attempts: 16,
            base_delay_ms: 1,
            max_delay_ms: 20,
        });
    let aggregator = Aggregator::new(store, remote.clone(), sync_config)?;

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();

    // concurrent producers
    let mut tasks = Vec::new();
    for k in 0..config.keys {
        for p in 0..config.producers_per_key {
            let producer = aggregator.producer(producer_source(k, p));
            let rounds = config.rounds;
            let priority = i32::try_from(p).unwrap_or(i32::MAX);
            tasks.push(tokio::spawn(async move {
                let key = sim_key(k);
                let mut written = 0u64;
                let mut retries = 0u64;
                for round in 0..rounds {
                    loop {
                        match producer
                            .contribute_fragment(&key, payload(k, p, round), priority)
                            .await
                        {
                            Ok(_) => break,
                            Err(StoreError::ContentionExhausted { .. }) if retries < 16 => {
                                retries += 1;
                            }
                            Err(err) => return Err((producer.source().to_string(), err)),
                        }
                    }
                    written += 1;
                }
                Ok((written, retries))
            }));
        }
    }
    for task in futures::future::join_all(tasks).await {
        match task {
            Ok(Ok((written, retries))) => {
                stats.contributions += written;
                stats.producer_retries += retries;
            }
            Ok(Err((source, err))) => violations.push(Violation::ProducerFailed {
                source,
                error: err.to_string(),
            }),
            Err(err) => violations.push(Violation::ProducerFailed {
                source: "<task>".to_string(),
                error: err.to_string(),
            }),
        }
    }

    settle(&aggregator, &config, &mut stats).await?;

    // withdraw every fragment of the first `teardown_keys` keys
    let teardown = config.teardown_keys.min(config.keys);
    for k in 0..teardown {
        for p in 0..config.producers_per_key {
            aggregator
                .producer(producer_source(k, p))
                .withdraw_fragment(&sim_key(k))
                .await?;
        }
    }
    settle(&aggregator, &config, &mut stats).await?;

    // a quiet remote for the final checks
    remote.set_faults(FaultProfile::default());
    settle(&aggregator, &config, &mut stats).await?;

    for k in 0..teardown {
        let key = sim_key(k);
        let remote_left = remote.object_for(&key).is_some();
        let record_left = aggregator.fragments().get(&key).await?.is_some();
        if remote_left || record_left {
            violations.push(Violation::TeardownIncomplete {
                key: key.to_string(),
                remote: remote_left,
                record: record_left,
            });
        }
    }

    for k in teardown..config.keys {
        let key = sim_key(k);
        check_live_key(&aggregator, &remote, &key, k, &config, &mut violations).await?;
    }

    let expected = config.keys - teardown;
    if remote.object_count() != expected {
        violations.push(Violation::DuplicateRemote {
            expected,
            actual: remote.object_count(),
        });
    }

    stats.remote = remote.calls();
    Ok(SimulatorReport {
        config,
        stats,
        violations,
    })
}

/// Sync every key until a full pass does no remote work
async fn settle(
    aggregator: &Aggregator,
    config: &SimulatorConfig,
    stats: &mut SimulatorStats,
) -> Result<(), SyncError> {
    for _ in 0..config.max_passes {
        stats.passes += 1;
        let outcomes = aggregator.sync_all().await?;
        let mut quiet = true;
        for (_, outcome) in &outcomes {
            *stats.outcomes.entry(outcome.as_str().to_string()).or_default() += 1;
            quiet &= matches!(outcome, CycleOutcome::UpToDate | CycleOutcome::Missing);
        }
        if quiet {
            break;
        }
    }
    Ok(())
}

async fn check_live_key(
    aggregator: &Aggregator,
    remote: &SimulatedRemote,
    key: &ExternalResourceKey,
    index: usize,
    config: &SimulatorConfig,
    violations: &mut Vec<Violation>,
) -> Result<(), SyncError> {
    let Some(status) = aggregator.status(key).await? else {
        violations.push(Violation::NotSynced {
            key: key.to_string(),
            phase: "missing".to_string(),
        });
        return Ok(());
    };
    if status.phase != SyncPhase::Synced {
        violations.push(Violation::NotSynced {
            key: key.to_string(),
            phase: format!("{:?}", status.phase),
        });
        return Ok(());
    }

    let document = status.aggregated_config.unwrap_or(JsonValue::Null);
    if status.config_hash != Some(ContentHash::of_document(&document)) {
        violations.push(Violation::HashMismatch {
            key: key.to_string(),
        });
    }
    if remote.object_for(key).map(|o| o.document) != Some(document.clone()) {
        violations.push(Violation::RemoteMismatch {
            key: key.to_string(),
        });
    }

    let hostnames: Vec<&str> = document["ingress"]
        .as_array()
        .map(|rules| rules.iter().filter_map(|r| r["hostname"].as_str()).collect())
        .unwrap_or_default();
    for p in 0..config.producers_per_key {
        let expected = hostname(index, p);
        if !hostnames.contains(&expected.as_str()) {
            violations.push(Violation::LostContribution {
                key: key.to_string(),
                hostname: expected,
            });
        }
    }
    Ok(())
}
