//! Partitioned cache tests under contention.
//!
//! The merge strategy here records every invocation and flags any two
//! merges running for the same partition at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Barrier, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_core::PartitionIndex;
use sluice_shuffle::{CacheEntry, FlushPolicy, MergeStrategy, PartitionedMessageCache};

#[derive(Debug)]
struct Batch(Vec<u64>);

impl CacheEntry for Batch {
    fn records(&self) -> usize {
        self.0.len()
    }

    fn bytes(&self) -> usize {
        self.0.len() * 8
    }
}

#[derive(Debug, Default)]
struct RecordingMerge {
    merged: Mutex<Vec<(PartitionIndex, Vec<u64>)>>,
    in_merge: Mutex<BTreeSet<PartitionIndex>>,
    invocations: AtomicU64,
    overlaps: AtomicU64,
    hold: Duration,
    fail: AtomicBool,
}

impl RecordingMerge {
    fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    fn merged(&self) -> Vec<(PartitionIndex, Vec<u64>)> {
        self.merged.lock().unwrap().clone()
    }

    fn values_for(&self, partition: PartitionIndex) -> Vec<u64> {
        self.merged()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .flat_map(|(_, values)| values)
            .collect()
    }
}

impl MergeStrategy<Batch> for RecordingMerge {
    fn merge(&self, partition: PartitionIndex, entries: Vec<Batch>) -> usize {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.in_merge.lock().unwrap().insert(partition) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.hold.is_zero() {
            std::thread::sleep(self.hold);
        }

        let values: Vec<u64> = entries.into_iter().flat_map(|b| b.0).collect();
        let delivered = if self.fail.load(Ordering::SeqCst) {
            0
        } else {
            values.len()
        };
        self.merged.lock().unwrap().push((partition, values));
        self.in_merge.lock().unwrap().remove(&partition);
        delivered
    }
}

fn unbounded() -> FlushPolicy {
    FlushPolicy::default()
        .with_max_records(usize::MAX)
        .with_max_bytes(usize::MAX)
}

#[test]
fn test_cache_merge_preserves_length_and_arrival_order() {
    let cache = PartitionedMessageCache::new(2, unbounded(), RecordingMerge::default());
    let p1 = PartitionIndex::new(1);
    cache.append(p1, Batch(vec![1, 2])).unwrap();
    cache.append(p1, Batch(vec![3])).unwrap();
    cache.append(p1, Batch(vec![4, 5, 6])).unwrap();
    assert_eq!(cache.pending_records(p1), 6);

    let report = cache.flush_blocking(p1).unwrap();

    assert_eq!(report.merges, 1);
    assert_eq!(report.delivered_records, 6);
    assert_eq!(cache.merge_strategy().merged(), vec![(p1, vec![1, 2, 3, 4, 5, 6])]);
    assert_eq!(cache.pending_records(p1), 0);
    assert_eq!(cache.pending_records(PartitionIndex::new(0)), 0);
}

#[test]
fn test_cache_hundred_concurrent_triggers_never_overlap() {
    let cache = PartitionedMessageCache::new(
        1,
        FlushPolicy::default().with_max_records(1),
        RecordingMerge::holding(Duration::from_millis(1)),
    );
    let p0 = PartitionIndex::new(0);
    let barrier = Barrier::new(100);

    std::thread::scope(|s| {
        for i in 0..100_u64 {
            let cache = &cache;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                if cache.append(p0, Batch(vec![i])).unwrap() {
                    cache.try_flush(p0).unwrap();
                }
            });
        }
    });
    let _ = cache.flush_all();

    let merge = cache.merge_strategy();
    assert_eq!(merge.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(merge.invocations.load(Ordering::SeqCst), cache.flush_count(p0));
    assert_eq!(cache.delivered_records(), 100);

    let mut values = merge.values_for(p0);
    values.sort_unstable();
    assert_eq!(values, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_cache_appends_during_flush_are_kept_in_order() {
    const THREADS: u64 = 16;
    const APPENDS: u64 = 200;
    const SPLIT: u32 = 8;

    let cache = PartitionedMessageCache::new(
        SPLIT,
        FlushPolicy::default().with_max_records(4),
        RecordingMerge::holding(Duration::from_micros(200)),
    );

    std::thread::scope(|s| {
        for thread in 0..THREADS {
            let cache = &cache;
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(thread);
                for i in 0..APPENDS {
                    let partition = PartitionIndex::new(rng.gen_range(0..u64::from(SPLIT)));
                    if cache.append(partition, Batch(vec![thread * 1_000 + i])).unwrap() {
                        cache.try_flush(partition).unwrap();
                    }
                }
            });
        }
    });
    let _ = cache.flush_all();

    let merge = cache.merge_strategy();
    assert_eq!(merge.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(cache.pending_records_total(), 0);
    assert_eq!(cache.delivered_records(), THREADS * APPENDS);

    // Each thread's values appear once, in append order within a partition.
    let mut seen = BTreeSet::new();
    for p in 0..u64::from(SPLIT) {
        let mut last: BTreeMap<u64, u64> = BTreeMap::new();
        for value in merge.values_for(PartitionIndex::new(p)) {
            assert!(seen.insert(value), "value {value} merged twice");
            let (thread, i) = (value / 1_000, value % 1_000);
            if let Some(previous) = last.insert(thread, i) {
                assert!(previous < i, "thread {thread}: {i} merged after {previous}");
            }
        }
    }
    assert_eq!(seen.len() as u64, THREADS * APPENDS);
}

#[test]
fn test_cache_failed_merge_is_settled() {
    let merge = RecordingMerge::default();
    merge.fail.store(true, Ordering::SeqCst);
    let cache = PartitionedMessageCache::new(1, unbounded(), merge);
    let p0 = PartitionIndex::new(0);

    cache.append(p0, Batch(vec![1, 2, 3])).unwrap();
    let report = cache.flush_blocking(p0).unwrap();

    assert_eq!(report.failed_records, 3);
    assert_eq!(report.delivered_records, 0);
    assert_eq!(cache.failed_records(), 3);
    assert_eq!(cache.pending_records(p0), 0);
    assert_eq!(cache.in_flight_records(), 0);

    // A later flush has nothing left to retry.
    assert_eq!(cache.flush_blocking(p0).unwrap().merges, 0);
}

#[test]
fn test_cache_rejects_out_of_range_partition() {
    let cache = PartitionedMessageCache::new(2, unbounded(), RecordingMerge::default());
    assert!(cache.append(PartitionIndex::new(2), Batch(vec![1])).is_err());
    assert!(cache.try_flush(PartitionIndex::new(5)).is_err());
}
