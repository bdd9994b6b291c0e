//! The shuffle stage - orchestrates routing, caching, flushing, and lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──reconfigure──> ConfigResolved ──start──> Running ──shutdown──> Draining ──> Stopped
//!        │                              │                     │
//!        └──────── fatal error ─────────┴──────> Unhealthy <──┘
//! ```
//!
//! `reconfigure` publishes an immutable snapshot of `{window, topology}`.
//! Ingest calls clone the current snapshot `Arc` and never see a partially
//! built one. The topology and producer are created once per stage.
//!
//! # Flushing
//!
//! `ingest` only appends. When a partition reaches a count or size trigger it
//! signals [`ShuffleStage::flush_wake`]; the [`crate::LingerFlusher`] wakes on
//! that signal (or its linger tick) and runs [`ShuffleStage::flush_ready`] on
//! a blocking thread, so producer writes and retry backoff never run on an
//! ingesting thread. Test mode is the exception: it flushes every partition
//! synchronously before `ingest` returns.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use sluice_core::{PartitionIndex, Record};
use sluice_routing::{FallbackKeys, PartitionKeyResolver, TopologyScope};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::cache::{FlushReport, PartitionedMessageCache};
use crate::collaborators::{Pipeline, Producer, TopologyCreator, Window, WindowRegistry};
use crate::compression::CompressionGate;
use crate::config::ShuffleConfig;
use crate::envelope::{PartialEnvelope, ShuffleEnvelopeBuilder};
use crate::error::{ShuffleError, ShuffleResult};
use crate::merge::EnvelopeMerge;
use crate::notifier::ConsumerStartNotifier;
use crate::provenance;
use crate::retry::RetryPolicy;
use crate::stats::ShuffleStats;

/// Lifecycle state of a shuffle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Constructed, nothing resolved yet.
    Uninitialized = 0,
    /// Window, topology, and producer are ready.
    ConfigResolved = 1,
    /// Accepting ingests.
    Running = 2,
    /// Shutting down, flushing remaining buffers.
    Draining = 3,
    /// Shut down.
    Stopped = 4,
    /// A fatal error occurred; ingests are refused.
    Unhealthy = 5,
}

impl StageState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::ConfigResolved,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Stopped,
            _ => Self::Unhealthy,
        }
    }

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ConfigResolved => "config_resolved",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared lifecycle state, visible to the merge step.
#[derive(Debug)]
pub struct StageStatus {
    state: AtomicU8,
    reason: Mutex<Option<String>>,
}

impl StageStatus {
    /// Creates an uninitialized status.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(StageState::Uninitialized as u8),
            reason: Mutex::new(None),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Sets the state unconditionally.
    pub fn set(&self, state: StageState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves from `from` to `to`. Returns false if the state was not `from`.
    pub fn transition(&self, from: StageState, to: StageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the stage unhealthy unless it has already stopped.
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == StageState::Stopped as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                StageState::Unhealthy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        error!(reason = %reason, "Shuffle stage marked unhealthy");
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(reason);
    }

    /// Returns the first reason the stage was marked unhealthy.
    #[must_use]
    pub fn unhealthy_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// External collaborators of a stage.
#[derive(Clone)]
pub struct StageContext {
    /// Resolves the configured window.
    pub windows: Arc<dyn WindowRegistry>,
    /// Creates the topology and producer.
    pub topology: Arc<dyn TopologyCreator>,
    /// Looks up the downstream stage for the consumer start signal.
    pub pipeline: Option<Arc<dyn Pipeline>>,
}

/// Per-call result of [`ShuffleStage::ingest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records in the batch.
    pub records: usize,
    /// System records kept out of the shuffle.
    pub system_skipped: usize,
    /// Records appended to a partition.
    pub routed: usize,
    /// Records routed with the null shuffle key.
    pub sentinel_keys: usize,
    /// Distinct partitions appended to.
    pub partitions: usize,
}

/// Topology-bound state, created once per stage.
struct ShuffleRuntime {
    scope: TopologyScope,
    resolver: PartitionKeyResolver,
    cache: PartitionedMessageCache<PartialEnvelope, EnvelopeMerge>,
    producer: Arc<dyn Producer>,
}

/// The immutable view published by `reconfigure`.
struct StageSnapshot {
    window: Option<Arc<dyn Window>>,
    runtime: Arc<ShuffleRuntime>,
}

/// Decrements the active ingest count on drop.
///
/// The count and the state are both `SeqCst`: an ingest that registers after
/// `shutdown` read zero is guaranteed to observe `Draining`.
struct ActiveIngest<'a>(&'a AtomicUsize);

impl<'a> ActiveIngest<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ActiveIngest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Repartitions a record stream across a fixed set of partitions.
///
/// `ingest` may be called concurrently from any number of threads. The only
/// serialization is per-partition flush exclusivity inside the cache and the
/// one-shot consumer start flag.
pub struct ShuffleStage {
    config: ShuffleConfig,
    context: StageContext,
    status: Arc<StageStatus>,
    stats: Arc<ShuffleStats>,
    notifier: ConsumerStartNotifier,
    snapshot: RwLock<Option<Arc<StageSnapshot>>>,
    reconfigure_lock: Mutex<()>,
    active_ingests: AtomicUsize,
    flush_wake: Notify,
}

impl ShuffleStage {
    /// Creates a stage.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ShuffleConfig, context: StageContext) -> ShuffleResult<Self> {
        config.validate()?;
        let stats = Arc::new(ShuffleStats::default());
        let notifier = ConsumerStartNotifier::new(
            context.pipeline.clone(),
            config.downstream_label.clone(),
            Arc::clone(&stats),
        );
        Ok(Self {
            config,
            context,
            status: Arc::new(StageStatus::new()),
            stats,
            notifier,
            snapshot: RwLock::new(None),
            reconfigure_lock: Mutex::new(()),
            active_ingests: AtomicUsize::new(0),
            flush_wake: Notify::new(),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ShuffleConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StageState {
        self.status.state()
    }

    /// Returns why the stage became unhealthy, if it did.
    #[must_use]
    pub fn unhealthy_reason(&self) -> Option<String> {
        self.status.unhealthy_reason()
    }

    /// Returns the stage counters.
    #[must_use]
    pub const fn stats(&self) -> &Arc<ShuffleStats> {
        &self.stats
    }

    /// Signalled when a partition reaches a count or size trigger.
    ///
    /// A signal sent while nobody waits is kept until the next wait.
    #[must_use]
    pub const fn flush_wake(&self) -> &Notify {
        &self.flush_wake
    }

    /// Returns true once the consumer start signal has been sent.
    #[must_use]
    pub fn has_notified(&self) -> bool {
        self.notifier.has_fired()
    }

    fn current(&self) -> Option<Arc<StageSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the topology scope, once resolved.
    #[must_use]
    pub fn topology_scope(&self) -> Option<TopologyScope> {
        self.current().map(|s| s.runtime.scope.clone())
    }

    /// Records buffered but not yet merged.
    #[must_use]
    pub fn pending_records(&self) -> usize {
        self.current()
            .map_or(0, |s| s.runtime.cache.pending_records_total())
    }

    /// Records buffered for one partition.
    #[must_use]
    pub fn pending_records_for(&self, index: PartitionIndex) -> usize {
        self.current()
            .map_or(0, |s| s.runtime.cache.pending_records(index))
    }

    /// Resolves the window and, on first call, creates the topology.
    ///
    /// Runs exclusively with other `reconfigure` calls. Concurrent ingests
    /// keep using the previous snapshot until the new one is published.
    ///
    /// # Errors
    /// Returns an error if the window cannot be found or the topology cannot
    /// be created. Either marks the stage unhealthy.
    pub fn reconfigure(&self) -> ShuffleResult<()> {
        let _guard = self
            .reconfigure_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let state = self.state();
        match state {
            StageState::Draining | StageState::Stopped => {
                return Err(ShuffleError::NotReady {
                    state,
                    required: StageState::Running,
                });
            }
            StageState::Unhealthy => return Err(self.unhealthy_error()),
            StageState::Uninitialized | StageState::ConfigResolved | StageState::Running => {}
        }

        let result = self.resolve_snapshot();
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.status.mark_unhealthy(err.to_string());
                return Err(err);
            }
        };

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));
        self.status
            .transition(StageState::Uninitialized, StageState::ConfigResolved);

        info!(
            owner = %self.config.owner_name,
            window = self.config.window_name.as_deref().unwrap_or("-"),
            split_count = self.config.split_count,
            test_mode = self.config.test_mode,
            "Shuffle stage configured"
        );
        Ok(())
    }

    fn resolve_snapshot(&self) -> ShuffleResult<StageSnapshot> {
        let window = match &self.config.window_name {
            Some(name) => {
                let Some(window) = self.context.windows.window(name) else {
                    error!(
                        window = %name,
                        "Configured window not found; refusing to fall back to ungrouped keys"
                    );
                    return Err(ShuffleError::WindowNotFound { name: name.clone() });
                };
                Some(window)
            }
            None => None,
        };

        let runtime = match self.current() {
            Some(existing) => Arc::clone(&existing.runtime),
            None => Arc::new(self.create_runtime()?),
        };
        Ok(StageSnapshot { window, runtime })
    }

    fn create_runtime(&self) -> ShuffleResult<ShuffleRuntime> {
        let config = &self.config;
        let scope = TopologyScope::new(
            config.source_identity.clone(),
            config.namespace.clone(),
            config.stage_name.clone(),
            config.owner_name.clone(),
            config.split_count,
        );
        scope.validate(&config.limits)?;

        let topology = self.context.topology.create(&scope)?;
        let created = topology.partitions.split_count();
        if created != config.split_count {
            return Err(ShuffleError::Topology {
                topic: scope.topic_name(),
                message: format!(
                    "creator returned {created} partitions, expected {}",
                    config.split_count
                ),
            });
        }

        let fallback = if config.round_robin_fallback {
            FallbackKeys::round_robin()
        } else {
            FallbackKeys::random(config.fallback_seed)
        };
        let resolver =
            PartitionKeyResolver::new(config.split_count, fallback, Arc::clone(&topology.partitioner));

        let merge = EnvelopeMerge::new(
            topology.partitions,
            ShuffleEnvelopeBuilder::new(config.owner_name.clone(), &config.limits),
            CompressionGate::new(config.compression, &config.limits),
            Arc::clone(&topology.producer),
            RetryPolicy::new(&config.retry),
            config.exhausted_write_policy,
            Arc::clone(&self.stats),
            Arc::clone(&self.status),
            &config.limits,
        );
        let cache = PartitionedMessageCache::new(config.split_count, config.flush, merge);

        info!(
            topic = %scope.topic_name(),
            split_count = config.split_count,
            codec = config.compression.codec.as_str(),
            "Created shuffle topology"
        );

        Ok(ShuffleRuntime {
            scope,
            resolver,
            cache,
            producer: topology.producer,
        })
    }

    /// Starts accepting ingests.
    ///
    /// # Errors
    /// Returns an error unless the stage is `ConfigResolved`.
    pub fn start(&self) -> ShuffleResult<()> {
        if self
            .status
            .transition(StageState::ConfigResolved, StageState::Running)
        {
            info!(owner = %self.config.owner_name, "Shuffle stage running");
            return Ok(());
        }
        match self.state() {
            StageState::Unhealthy => Err(self.unhealthy_error()),
            state => Err(ShuffleError::NotReady {
                state,
                required: StageState::ConfigResolved,
            }),
        }
    }

    fn unhealthy_error(&self) -> ShuffleError {
        ShuffleError::Unhealthy {
            reason: self
                .status
                .unhealthy_reason()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Shuffles a batch of records.
    ///
    /// Every record is first handed to the window, if one is configured; a
    /// window error is logged and counted, and the record is still shuffled.
    /// System records are then skipped, and every other record is stamped
    /// with provenance and appended to its partition. A partition that
    /// reaches a trigger is left for the flusher; see the module docs.
    ///
    /// # Errors
    /// Returns an error if the stage is not `Running`.
    pub fn ingest(&self, records: Vec<Record>) -> ShuffleResult<IngestSummary> {
        let _active = ActiveIngest::enter(&self.active_ingests);
        match self.state() {
            StageState::Running => {}
            StageState::Unhealthy => return Err(self.unhealthy_error()),
            state => {
                return Err(ShuffleError::NotReady {
                    state,
                    required: StageState::Running,
                })
            }
        }
        let Some(snapshot) = self.current() else {
            return Err(ShuffleError::NotReady {
                state: StageState::Uninitialized,
                required: StageState::Running,
            });
        };

        self.notifier.notify_if_first();

        let mut summary = IngestSummary {
            records: records.len(),
            ..IngestSummary::default()
        };
        ShuffleStats::add(&self.stats.records_ingested, records.len() as u64);

        if let Some(window) = &snapshot.window {
            for record in &records {
                if let Err(err) = window.do_message(record) {
                    ShuffleStats::add(&self.stats.window_failures, 1);
                    warn!(
                        window = window.name(),
                        queue_id = %record.header.queue_id,
                        offset = %record.header.offset,
                        error = %err,
                        "Window rejected record, shuffling anyway"
                    );
                }
            }
        }

        let runtime = &snapshot.runtime;
        let mut grouped: BTreeMap<PartitionIndex, PartialEnvelope> = BTreeMap::new();
        for record in records {
            if record.is_system_message() {
                summary.system_skipped += 1;
                continue;
            }
            let resolved = runtime.resolver.resolve(&record, snapshot.window.as_deref());
            if resolved.substituted {
                summary.sentinel_keys += 1;
            }
            let index = runtime.resolver.to_index(&resolved.key);
            grouped
                .entry(index)
                .or_default()
                .push(provenance::stamp(record, &resolved.key));
            summary.routed += 1;
        }
        summary.partitions = grouped.len();
        ShuffleStats::add(&self.stats.system_records_skipped, summary.system_skipped as u64);
        ShuffleStats::add(&self.stats.sentinel_keys, summary.sentinel_keys as u64);

        let mut triggered = false;
        for (index, partial) in grouped {
            triggered |= runtime.cache.append(index, partial)?;
        }

        if self.config.test_mode {
            let total = self.stats.records_ingested.load(Ordering::Relaxed);
            info!(owner = %self.config.owner_name, count = total, "Shuffled records");
            let _ = runtime.cache.flush_all();
        } else if triggered {
            self.flush_wake.notify_one();
        }

        Ok(summary)
    }

    /// Flushes every partition, waiting for in-progress flushes.
    ///
    /// # Errors
    /// Returns an error if the topology has not been created.
    pub fn flush_all(&self) -> ShuffleResult<FlushReport> {
        let snapshot = self.current().ok_or(ShuffleError::NotReady {
            state: self.state(),
            required: StageState::ConfigResolved,
        })?;
        Ok(snapshot.runtime.cache.flush_all())
    }

    /// Flushes partitions that reached a count, size, or linger trigger.
    ///
    /// Runs merges, and so producer writes, on the calling thread.
    #[must_use]
    pub fn flush_ready(&self, now: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        if !matches!(self.state(), StageState::Running | StageState::Draining) {
            return report;
        }
        let Some(snapshot) = self.current() else {
            return report;
        };
        for index in snapshot.runtime.cache.ready_partitions(now) {
            if let Ok(partial) = snapshot.runtime.cache.try_flush(index) {
                report.merges += partial.merges;
                report.delivered_records += partial.delivered_records;
                report.failed_records += partial.failed_records;
                report.deferred |= partial.deferred;
            }
        }
        report
    }

    /// Stops accepting ingests, flushes remaining buffers, and closes the producer.
    ///
    /// Idempotent: calling it on a stopped stage returns an empty report.
    pub fn shutdown(&self) -> FlushReport {
        let _guard = self
            .reconfigure_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let state = self.state();
        if state == StageState::Stopped {
            return FlushReport::default();
        }
        self.status.set(StageState::Draining);
        info!(owner = %self.config.owner_name, from = %state, "Draining shuffle stage");

        // Ingests that passed the state check before Draining finish appending.
        while self.active_ingests.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let report = match self.current() {
            Some(snapshot) => {
                let report = snapshot.runtime.cache.flush_all();
                snapshot.runtime.producer.close();
                report
            }
            None => FlushReport::default(),
        };

        self.status.set(StageState::Stopped);
        info!(
            owner = %self.config.owner_name,
            merges = report.merges,
            delivered = report.delivered_records,
            failed = report.failed_records,
            "Shuffle stage stopped"
        );
        report
    }
}

impl fmt::Debug for ShuffleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleStage")
            .field("owner", &self.config.owner_name)
            .field("state", &self.state())
            .field("split_count", &self.config.split_count)
            .finish_non_exhaustive()
    }
}
