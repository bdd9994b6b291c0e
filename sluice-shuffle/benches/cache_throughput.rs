//! Partitioned cache and shuffle ingest benchmarks.
//!
//! Measures append/flush throughput of the per-partition cache in isolation
//! and end-to-end ingest through a stage backed by the in-memory transport.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_core::{PartitionIndex, Record, RecordBody, RecordHeader};
use sluice_shuffle::memory::{FieldKeyWindow, MemoryTopologyCreator, MemoryWindowRegistry};
use sluice_shuffle::{
    CompressionConfig, FlushPolicy, MergeStrategy, PartialEnvelope, PartitionedMessageCache,
    ShuffleConfig, ShuffleStage, StageContext, TopologyCreator,
};

/// Merge that only counts records.
#[derive(Default)]
struct CountingMerge(AtomicU64);

impl MergeStrategy<PartialEnvelope> for CountingMerge {
    fn merge(&self, _partition: PartitionIndex, entries: Vec<PartialEnvelope>) -> usize {
        let records: usize = entries.iter().map(|e| e.bodies().len()).sum();
        self.0.fetch_add(records as u64, Ordering::Relaxed);
        records
    }
}

fn body(i: u64) -> RecordBody {
    RecordBody::new()
        .with_field("user", format!("user-{}", i % 100))
        .with_field("amount", i as i64)
}

fn record(i: u64) -> Record {
    Record::new(RecordHeader::new("q0", i.to_string()), body(i))
}

fn bench_cache_append_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_append_flush");

    for entry_size in [1_u64, 16, 128] {
        group.throughput(Throughput::Elements(entry_size * 64));
        group.bench_with_input(
            BenchmarkId::from_parameter(entry_size),
            &entry_size,
            |b, &entry_size| {
                let cache = PartitionedMessageCache::new(
                    8,
                    FlushPolicy::default().with_max_records(usize::MAX),
                    CountingMerge::default(),
                );
                b.iter(|| {
                    for i in 0..64_u64 {
                        let entry: PartialEnvelope = (0..entry_size).map(body).collect();
                        cache
                            .append(PartitionIndex::new(i % 8), entry)
                            .unwrap_or_default();
                    }
                    black_box(cache.flush_all());
                });
            },
        );
    }

    group.finish();
}

fn bench_stage_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_ingest");
    let batch: Vec<Record> = (0..256).map(record).collect();
    group.throughput(Throughput::Elements(batch.len() as u64));

    for (name, windowed) in [("fallback", false), ("window", true)] {
        let windows = MemoryWindowRegistry::new();
        windows.register(Arc::new(FieldKeyWindow::new("w", "user")));
        let context = StageContext {
            windows: Arc::new(windows),
            topology: Arc::new(MemoryTopologyCreator::new()) as Arc<dyn TopologyCreator>,
            pipeline: None,
        };
        let mut config = ShuffleConfig::new("bench", 16)
            .with_fallback_seed(7)
            .with_compression(CompressionConfig::disabled());
        if windowed {
            config = config.with_window("w");
        }
        let stage = ShuffleStage::new(config, context).expect("valid config");
        stage.reconfigure().expect("reconfigure");
        stage.start().expect("start");

        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(stage.ingest(batch.clone()).expect("ingest"));
                black_box(stage.flush_ready(Instant::now()));
            });
        });
        let _ = stage.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_cache_append_flush, bench_stage_ingest);
criterion_main!(benches);
