//! Per-partition append buffer with merge-on-flush.
//!
//! # Design
//!
//! ```text
//! append ──> [slot 0: Mutex<PendingBatch>] ──flush──> swap ──> MergeStrategy::merge (once)
//! append ──> [slot 1: Mutex<PendingBatch>] ──flush──> swap ──> MergeStrategy::merge (once)
//! ```
//!
//! Each slot has two locks. The pending lock is held only long enough to push
//! an entry or swap the queue for an empty one, so appends never wait on a
//! merge. The flush lock serializes merges for the slot. A flush requested
//! while another is running sets the slot's rerun flag; the running flusher
//! loops once more before returning, so the request is queued rather than
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use sluice_core::PartitionIndex;
use sluice_routing::RoutingError;

use crate::config::FlushPolicy;
use crate::error::ShuffleResult;

/// Size accounting for a cached entry.
pub trait CacheEntry: Send {
    /// Number of records in the entry.
    fn records(&self) -> usize;
    /// Encoded size of the entry in bytes.
    fn bytes(&self) -> usize;
}

/// Merges one flushed snapshot of a partition.
///
/// Called exactly once per snapshot, with entries in append order. Returns
/// the number of records delivered; the rest of the snapshot counts as failed.
pub trait MergeStrategy<T>: Send + Sync {
    /// Merges a snapshot.
    fn merge(&self, partition: PartitionIndex, entries: Vec<T>) -> usize;
}

/// Entries accumulated since the last flush.
#[derive(Debug)]
struct PendingBatch<T> {
    entries: Vec<T>,
    records: usize,
    bytes: usize,
    first_append: Option<Instant>,
}

impl<T> PendingBatch<T> {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            records: 0,
            bytes: 0,
            first_append: None,
        }
    }
}

impl<T> Default for PendingBatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SlotCounters {
    flushes: AtomicU64,
    delivered_records: AtomicU64,
    failed_records: AtomicU64,
    in_flight_records: AtomicU64,
}

#[derive(Debug)]
struct PartitionSlot<T> {
    pending: Mutex<PendingBatch<T>>,
    flush_lock: Mutex<()>,
    rerun: AtomicBool,
    counters: SlotCounters,
}

impl<T> PartitionSlot<T> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(PendingBatch::new()),
            flush_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            counters: SlotCounters::default(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingBatch<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_flush_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match self.flush_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Acquires the flush lock, or queues a rerun with the current holder.
    fn acquire(&self, blocking: bool) -> Option<MutexGuard<'_, ()>> {
        if blocking {
            return Some(self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner));
        }
        if let Some(guard) = self.try_flush_lock() {
            return Some(guard);
        }
        self.rerun.store(true, Ordering::SeqCst);
        // The holder may have released between the first attempt and the store.
        self.try_flush_lock()
    }
}

/// Outcome of merging one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// The snapshot was merged.
    Merged {
        /// Entries in the snapshot.
        entries: usize,
        /// Records delivered.
        delivered: usize,
        /// Records the merge could not deliver.
        failed: usize,
    },
}

/// Accumulated result of one flush request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of merge invocations.
    pub merges: u64,
    /// Records delivered.
    pub delivered_records: u64,
    /// Records whose merge failed.
    pub failed_records: u64,
    /// True if another flush was running and this request was queued with it.
    pub deferred: bool,
}

impl FlushReport {
    fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => {}
            FlushOutcome::Merged {
                delivered, failed, ..
            } => {
                self.merges += 1;
                self.delivered_records += delivered as u64;
                self.failed_records += failed as u64;
            }
        }
    }

    fn absorb(&mut self, other: Self) {
        self.merges += other.merges;
        self.delivered_records += other.delivered_records;
        self.failed_records += other.failed_records;
        self.deferred |= other.deferred;
    }
}

/// Per-partition buffers feeding a merge strategy.
#[derive(Debug)]
pub struct PartitionedMessageCache<T, M> {
    slots: Vec<PartitionSlot<T>>,
    policy: FlushPolicy,
    merge: M,
}

impl<T, M> PartitionedMessageCache<T, M>
where
    T: CacheEntry,
    M: MergeStrategy<T>,
{
    /// Creates a cache with one slot per partition.
    #[must_use]
    pub fn new(split_count: u32, policy: FlushPolicy, merge: M) -> Self {
        let slots = (0..split_count).map(|_| PartitionSlot::new()).collect();
        Self {
            slots,
            policy,
            merge,
        }
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn split_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns the merge strategy.
    pub const fn merge_strategy(&self) -> &M {
        &self.merge
    }

    #[allow(clippy::cast_possible_truncation)] // Bounded by split_count_max.
    fn slot(&self, index: PartitionIndex) -> ShuffleResult<&PartitionSlot<T>> {
        self.slots.get(index.as_usize()).ok_or_else(|| {
            RoutingError::PartitionOutOfRange {
                index: index.get(),
                split_count: self.slots.len() as u32,
            }
            .into()
        })
    }

    /// Appends an entry to a partition.
    ///
    /// Returns true if the partition reached a count or size trigger.
    ///
    /// # Errors
    /// Returns an error if `index` is outside the topology.
    pub fn append(&self, index: PartitionIndex, entry: T) -> ShuffleResult<bool> {
        let slot = self.slot(index)?;
        let mut pending = slot.pending();
        pending.records += entry.records();
        pending.bytes += entry.bytes();
        pending.first_append.get_or_insert_with(Instant::now);
        pending.entries.push(entry);
        Ok(pending.records >= self.policy.max_records || pending.bytes >= self.policy.max_bytes)
    }

    /// Flushes a partition unless a flush is already running for it.
    ///
    /// A request that finds a flush in progress is handed to that flusher,
    /// which loops once more before returning.
    ///
    /// # Errors
    /// Returns an error if `index` is outside the topology.
    pub fn try_flush(&self, index: PartitionIndex) -> ShuffleResult<FlushReport> {
        self.flush_slot(index, false)
    }

    /// Flushes a partition, waiting for an in-progress flush to finish.
    ///
    /// # Errors
    /// Returns an error if `index` is outside the topology.
    pub fn flush_blocking(&self, index: PartitionIndex) -> ShuffleResult<FlushReport> {
        self.flush_slot(index, true)
    }

    /// Flushes every partition, waiting for in-progress flushes.
    #[must_use]
    pub fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for i in 0..self.slots.len() as u64 {
            if let Ok(partial) = self.flush_slot(PartitionIndex::new(i), true) {
                report.absorb(partial);
            }
        }
        report
    }

    fn flush_slot(&self, index: PartitionIndex, blocking: bool) -> ShuffleResult<FlushReport> {
        let slot = self.slot(index)?;
        let mut report = FlushReport::default();
        loop {
            let Some(guard) = slot.acquire(blocking) else {
                report.deferred = true;
                return Ok(report);
            };
            slot.rerun.store(false, Ordering::SeqCst);
            report.record(self.flush_locked(index, slot));
            drop(guard);

            if !slot.rerun.load(Ordering::SeqCst) {
                return Ok(report);
            }
        }
    }

    /// Swaps out the pending queue and merges it. Caller holds the flush lock.
    fn flush_locked(&self, index: PartitionIndex, slot: &PartitionSlot<T>) -> FlushOutcome {
        let snapshot = std::mem::take(&mut *slot.pending());
        if snapshot.entries.is_empty() {
            return FlushOutcome::Empty;
        }

        let entries = snapshot.entries.len();
        let records = snapshot.records;
        let counters = &slot.counters;
        counters.flushes.fetch_add(1, Ordering::Relaxed);
        counters
            .in_flight_records
            .store(records as u64, Ordering::Relaxed);

        let delivered = self.merge.merge(index, snapshot.entries).min(records);
        let failed = records - delivered;

        // The snapshot is settled either way and is never merged again.
        counters.in_flight_records.store(0, Ordering::Relaxed);
        counters
            .delivered_records
            .fetch_add(delivered as u64, Ordering::Relaxed);
        counters
            .failed_records
            .fetch_add(failed as u64, Ordering::Relaxed);
        FlushOutcome::Merged {
            entries,
            delivered,
            failed,
        }
    }

    fn is_ready(&self, pending: &PendingBatch<T>, now: Instant) -> bool {
        pending.records >= self.policy.max_records
            || pending.bytes >= self.policy.max_bytes
            || pending
                .first_append
                .is_some_and(|t| now.saturating_duration_since(t) >= self.policy.max_linger)
    }

    /// Returns partitions that reached a count, size, or linger trigger.
    #[must_use]
    pub fn ready_partitions(&self, now: Instant) -> Vec<PartitionIndex> {
        (0_u64..)
            .zip(&self.slots)
            .filter(|(_, slot)| self.is_ready(&slot.pending(), now))
            .map(|(i, _)| PartitionIndex::new(i))
            .collect()
    }

    /// Records pending in one partition.
    #[must_use]
    pub fn pending_records(&self, index: PartitionIndex) -> usize {
        self.slots
            .get(index.as_usize())
            .map_or(0, |slot| slot.pending().records)
    }

    /// Records pending across all partitions.
    #[must_use]
    pub fn pending_records_total(&self) -> usize {
        self.slots.iter().map(|slot| slot.pending().records).sum()
    }

    /// Records currently inside a merge.
    #[must_use]
    pub fn in_flight_records(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.counters.in_flight_records.load(Ordering::Relaxed))
            .sum()
    }

    /// Merges invoked for one partition.
    #[must_use]
    pub fn flush_count(&self, index: PartitionIndex) -> u64 {
        self.slots
            .get(index.as_usize())
            .map_or(0, |slot| slot.counters.flushes.load(Ordering::Relaxed))
    }

    /// Records delivered across all partitions.
    #[must_use]
    pub fn delivered_records(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.counters.delivered_records.load(Ordering::Relaxed))
            .sum()
    }

    /// Records whose merge failed across all partitions.
    #[must_use]
    pub fn failed_records(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.counters.failed_records.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Batch(Vec<u32>);

    impl CacheEntry for Batch {
        fn records(&self) -> usize {
            self.0.len()
        }

        fn bytes(&self) -> usize {
            self.0.len() * 4
        }
    }

    /// Collects merged snapshots and flags overlapping merges.
    #[derive(Debug, Default)]
    struct Collect {
        merged: Mutex<Vec<(u64, Vec<u32>)>>,
        active: AtomicBool,
        overlaps: AtomicU64,
        fail: AtomicBool,
        pause: Option<Duration>,
    }

    impl MergeStrategy<Batch> for Collect {
        fn merge(&self, partition: PartitionIndex, entries: Vec<Batch>) -> usize {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(pause) = self.pause {
                std::thread::sleep(pause);
            }
            let records: Vec<u32> = entries.into_iter().flat_map(|b| b.0).collect();
            let delivered = if self.fail.load(Ordering::SeqCst) {
                0
            } else {
                records.len()
            };
            self.merged.lock().unwrap().push((partition.get(), records));
            self.active.store(false, Ordering::SeqCst);
            delivered
        }
    }

    fn policy() -> FlushPolicy {
        FlushPolicy::default()
            .with_max_records(10)
            .with_max_bytes(1024)
            .with_max_linger(Duration::from_millis(20))
    }

    fn p(i: u64) -> PartitionIndex {
        PartitionIndex::new(i)
    }

    #[test]
    fn test_cache_merge_preserves_append_order() {
        let cache = PartitionedMessageCache::new(2, policy(), Collect::default());
        cache.append(p(1), Batch(vec![1, 2])).unwrap();
        cache.append(p(1), Batch(vec![3])).unwrap();
        cache.append(p(1), Batch(vec![4, 5, 6])).unwrap();

        let report = cache.flush_blocking(p(1)).unwrap();
        assert_eq!(report.merges, 1);
        assert_eq!(report.delivered_records, 6);

        let merged = cache.merge_strategy().merged.lock().unwrap().clone();
        assert_eq!(merged, vec![(1, vec![1, 2, 3, 4, 5, 6])]);
        assert_eq!(cache.pending_records(p(1)), 0);
    }

    #[test]
    fn test_cache_flush_empty_skips_merge() {
        let cache = PartitionedMessageCache::new(2, policy(), Collect::default());
        let report = cache.flush_blocking(p(0)).unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(cache.merge_strategy().merged.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cache_append_reports_trigger() {
        let cache = PartitionedMessageCache::new(1, policy(), Collect::default());
        assert!(!cache.append(p(0), Batch(vec![0; 9])).unwrap());
        assert!(cache.append(p(0), Batch(vec![0])).unwrap());

        let by_bytes = PartitionedMessageCache::new(1, policy(), Collect::default());
        assert!(by_bytes.append(p(0), Batch(vec![0; 256])).unwrap());
    }

    #[test]
    fn test_cache_rejects_out_of_range() {
        let cache = PartitionedMessageCache::new(2, policy(), Collect::default());
        assert!(cache.append(p(2), Batch(vec![1])).is_err());
        assert!(cache.try_flush(p(5)).is_err());
    }

    #[test]
    fn test_cache_failed_merge_not_redelivered() {
        let merge = Collect::default();
        merge.fail.store(true, Ordering::SeqCst);
        let cache = PartitionedMessageCache::new(1, policy(), merge);

        cache.append(p(0), Batch(vec![1, 2, 3])).unwrap();
        let report = cache.flush_blocking(p(0)).unwrap();
        assert_eq!(report.failed_records, 3);
        assert_eq!(cache.failed_records(), 3);
        assert_eq!(cache.delivered_records(), 0);

        // The failed snapshot is not merged a second time.
        let again = cache.flush_blocking(p(0)).unwrap();
        assert_eq!(again.merges, 0);
        assert_eq!(cache.merge_strategy().merged.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cache_ready_partitions() {
        let cache = PartitionedMessageCache::new(3, policy(), Collect::default());
        cache.append(p(2), Batch(vec![1])).unwrap();
        cache.append(p(0), Batch(vec![0; 10])).unwrap();

        let now = Instant::now();
        assert_eq!(cache.ready_partitions(now), vec![p(0)]);
        assert_eq!(
            cache.ready_partitions(now + Duration::from_millis(25)),
            vec![p(0), p(2)]
        );
    }

    #[test]
    fn test_cache_partial_delivery_is_split() {
        struct HalfMerge;

        impl MergeStrategy<Batch> for HalfMerge {
            fn merge(&self, _partition: PartitionIndex, entries: Vec<Batch>) -> usize {
                entries.iter().map(CacheEntry::records).sum::<usize>() / 2
            }
        }

        let cache = PartitionedMessageCache::new(1, policy(), HalfMerge);
        cache.append(p(0), Batch(vec![1, 2, 3, 4])).unwrap();
        let report = cache.flush_blocking(p(0)).unwrap();

        assert_eq!(report.delivered_records, 2);
        assert_eq!(report.failed_records, 2);
        assert_eq!(cache.delivered_records(), 2);
        assert_eq!(cache.failed_records(), 2);
    }

    #[test]
    fn test_cache_busy_flush_is_queued() {
        let merge = Collect {
            pause: Some(Duration::from_millis(50)),
            ..Collect::default()
        };
        let cache = Arc::new(PartitionedMessageCache::new(1, policy(), merge));
        cache.append(p(0), Batch(vec![1])).unwrap();

        let flusher = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.flush_blocking(p(0)).unwrap())
        };

        // Wait until the first merge is running, then append and request a flush.
        while !cache.merge_strategy().active.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        cache.append(p(0), Batch(vec![2])).unwrap();
        let deferred = cache.try_flush(p(0)).unwrap();
        assert!(deferred.deferred);
        assert_eq!(deferred.merges, 0);

        let report = flusher.join().unwrap();
        assert_eq!(report.merges, 2);
        assert_eq!(cache.pending_records_total(), 0);

        let merged = cache.merge_strategy().merged.lock().unwrap().clone();
        assert_eq!(merged, vec![(0, vec![1]), (0, vec![2])]);
        assert_eq!(cache.merge_strategy().overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cache_concurrent_flushes_never_overlap() {
        const THREADS: u32 = 100;
        let cache = PartitionedMessageCache::new(1, policy(), Collect::default());
        let barrier = Barrier::new(THREADS as usize);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let cache = &cache;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    cache.append(p(0), Batch(vec![t])).unwrap();
                    cache.try_flush(p(0)).unwrap();
                });
            }
        });
        let _ = cache.flush_all();

        let merge = cache.merge_strategy();
        assert_eq!(merge.overlaps.load(Ordering::SeqCst), 0);

        let merged = merge.merged.lock().unwrap();
        assert_eq!(merged.len() as u64, cache.flush_count(p(0)));

        let mut all: Vec<u32> = merged.iter().flat_map(|(_, r)| r.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..THREADS).collect::<Vec<_>>());
        drop(merged);
        assert_eq!(cache.delivered_records(), u64::from(THREADS));
    }
}
