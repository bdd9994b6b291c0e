//! Shuffle stage benchmark tool.
//!
//! Drives a shuffle stage backed by the in-memory transport from several
//! worker threads and reports throughput and stage counters.
//!
//! # Usage
//!
//! ```bash
//! # 8 workers, 1M records, 16 partitions, grouped by user
//! shuffle-bench --workers 8 --records 1000000 --split-count 16 --window
//!
//! # Random fallback keys, zstd for every envelope
//! shuffle-bench --codec zstd --always-compress
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::cast_precision_loss)] // f64 precision loss acceptable in benchmark stats
#![allow(clippy::cast_possible_truncation)] // Safe casts in benchmark context

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use sluice_core::{Compression, Record, RecordBody, RecordHeader};
use sluice_shuffle::memory::{FieldKeyWindow, MemoryPipeline, MemoryTopologyCreator, MemoryWindowRegistry};
use sluice_shuffle::{
    CompressionConfig, FlushPolicy, LingerFlusher, ShuffleConfig, ShuffleStage, StageContext,
    TopologyCreator,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Codec selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Codec {
    /// No compression.
    None,
    /// LZ4 blocks.
    Lz4,
    /// Zstd streams.
    Zstd,
}

impl From<Codec> for Compression {
    fn from(codec: Codec) -> Self {
        match codec {
            Codec::None => Self::None,
            Codec::Lz4 => Self::Lz4,
            Codec::Zstd => Self::Zstd,
        }
    }
}

/// Shuffle stage benchmark.
#[derive(Parser, Debug)]
#[command(name = "shuffle-bench")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads calling ingest concurrently.
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Total records to ingest.
    #[arg(long, default_value = "200000")]
    records: usize,

    /// Records per ingest call.
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Destination partitions.
    #[arg(long, default_value = "8")]
    split_count: u32,

    /// Distinct users (grouping keys).
    #[arg(long, default_value = "1000")]
    users: usize,

    /// Group by user through a window instead of random fallback keys.
    #[arg(long)]
    window: bool,

    /// Envelope codec.
    #[arg(long, value_enum, default_value = "lz4")]
    codec: Codec,

    /// Compress every envelope regardless of size.
    #[arg(long)]
    always_compress: bool,

    /// Flush a partition after this many records.
    #[arg(long, default_value = "1000")]
    max_records: usize,

    /// Flush a partition after this many milliseconds.
    #[arg(long, default_value = "20")]
    linger_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn make_batch(worker: usize, batch: usize, size: usize, users: usize) -> Vec<Record> {
    (0..size)
        .map(|i| {
            let offset = batch * size + i;
            Record::new(
                RecordHeader::new(format!("queue-{worker}"), offset.to_string())
                    .with_trace_id(format!("req-{worker}-{offset}")),
                RecordBody::new()
                    .with_field("user", format!("user-{}", (offset * 31 + worker) % users.max(1)))
                    .with_field("amount", offset as i64)
                    .with_field("note", "shuffle benchmark payload"),
            )
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ShuffleConfig::new("bench_owner", args.split_count)
        .with_scope("bench-source", "bench", "shuffle")
        .with_flush(
            FlushPolicy::default()
                .with_max_records(args.max_records)
                .with_max_linger(Duration::from_millis(args.linger_ms)),
        )
        .with_compression(
            CompressionConfig::default()
                .with_codec(args.codec.into())
                .with_always(args.always_compress),
        );
    if args.window {
        config = config.with_window("bench_window");
    }

    let windows = MemoryWindowRegistry::new();
    windows.register(Arc::new(FieldKeyWindow::new("bench_window", "user")));
    let creator = Arc::new(MemoryTopologyCreator::new());
    let context = StageContext {
        windows: Arc::new(windows),
        topology: Arc::clone(&creator) as Arc<dyn TopologyCreator>,
        pipeline: Some(Arc::new(MemoryPipeline::new())),
    };

    let stage = Arc::new(ShuffleStage::new(config, context)?);
    stage.reconfigure()?;
    stage.start()?;
    let flusher = LingerFlusher::spawn(Arc::clone(&stage));

    info!(
        workers = args.workers,
        records = args.records,
        split_count = args.split_count,
        codec = ?args.codec,
        window = args.window,
        "Starting shuffle benchmark"
    );

    let workers = args.workers.max(1);
    let batch_size = args.batch_size.max(1);
    let batches_per_worker = args.records / (workers * batch_size);
    let users = args.users;

    let ingesting = Arc::clone(&stage);
    let start = Instant::now();
    let failed = tokio::task::spawn_blocking(move || {
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let stage = &ingesting;
                    s.spawn(move || {
                        let mut failed = 0_usize;
                        for batch in 0..batches_per_worker {
                            let records = make_batch(worker, batch, batch_size, users);
                            if stage.ingest(records).is_err() {
                                failed += 1;
                            }
                        }
                        failed
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(0))
                .sum::<usize>()
        })
    })
    .await?;
    let ingest_elapsed = start.elapsed();

    flusher.stop().await;
    let drain = stage.shutdown();
    let total_elapsed = start.elapsed();

    let stats = stage.stats().snapshot();
    let ingested = stats.records_ingested;
    println!("=== Shuffle Benchmark ===");
    println!("workers:            {workers}");
    println!("split count:        {}", args.split_count);
    println!("records ingested:   {ingested}");
    println!("failed ingests:     {failed}");
    println!(
        "ingest throughput:  {:.0} records/s",
        ingested as f64 / ingest_elapsed.as_secs_f64()
    );
    println!(
        "end-to-end:         {:.0} records/s ({:?})",
        stats.records_written as f64 / total_elapsed.as_secs_f64(),
        total_elapsed
    );
    println!("envelopes written:  {}", stats.envelopes_written);
    println!("  compressed:       {}", stats.envelopes_compressed);
    println!("records written:    {}", stats.records_written);
    println!("bytes written:      {}", stats.bytes_written);
    println!("drained on stop:    {}", drain.delivered_records);
    println!("write retries:      {}", stats.write_retries);
    println!("records dropped:    {}", stats.records_dropped);
    println!("sentinel keys:      {}", stats.sentinel_keys);
    println!("frames in memory:   {}", creator.producer().frames().len());

    Ok(())
}
