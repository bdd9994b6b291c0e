//! Shuffle stage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the stage, its merge strategy, and the notifier.
#[derive(Debug, Default)]
pub struct ShuffleStats {
    /// Records accepted by `ingest`, system records included.
    pub records_ingested: AtomicU64,
    /// System records kept out of the shuffle.
    pub system_records_skipped: AtomicU64,
    /// Records routed with the null shuffle key.
    pub sentinel_keys: AtomicU64,
    /// Window callbacks that returned an error.
    pub window_failures: AtomicU64,
    /// Envelopes accepted by the producer.
    pub envelopes_written: AtomicU64,
    /// Records inside written envelopes.
    pub records_written: AtomicU64,
    /// Written envelopes that were compressed.
    pub envelopes_compressed: AtomicU64,
    /// Encoded bytes of written envelopes.
    pub bytes_written: AtomicU64,
    /// Producer calls retried after a transient error.
    pub write_retries: AtomicU64,
    /// Batches dropped after a failed merge.
    pub batches_dropped: AtomicU64,
    /// Records inside dropped batches.
    pub records_dropped: AtomicU64,
    /// Envelopes rejected by the compression gate.
    pub compression_failures: AtomicU64,
    /// Control signals delivered downstream.
    pub control_signals: AtomicU64,
}

impl ShuffleStats {
    /// Adds `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Records a dropped batch.
    pub fn record_drop(&self, records: usize) {
        Self::add(&self.batches_dropped, 1);
        Self::add(&self.records_dropped, records as u64);
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> ShuffleStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ShuffleStatsSnapshot {
            records_ingested: load(&self.records_ingested),
            system_records_skipped: load(&self.system_records_skipped),
            sentinel_keys: load(&self.sentinel_keys),
            window_failures: load(&self.window_failures),
            envelopes_written: load(&self.envelopes_written),
            records_written: load(&self.records_written),
            envelopes_compressed: load(&self.envelopes_compressed),
            bytes_written: load(&self.bytes_written),
            write_retries: load(&self.write_retries),
            batches_dropped: load(&self.batches_dropped),
            records_dropped: load(&self.records_dropped),
            compression_failures: load(&self.compression_failures),
            control_signals: load(&self.control_signals),
        }
    }
}

/// Point-in-time copy of [`ShuffleStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ShuffleStatsSnapshot {
    pub records_ingested: u64,
    pub system_records_skipped: u64,
    pub sentinel_keys: u64,
    pub window_failures: u64,
    pub envelopes_written: u64,
    pub records_written: u64,
    pub envelopes_compressed: u64,
    pub bytes_written: u64,
    pub write_retries: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
    pub compression_failures: u64,
    pub control_signals: u64,
}
