//! The merge step run for each flushed partition snapshot.
//!
//! ```text
//! snapshot ──> concat bodies ──> split to limits ──> build envelope ──> compression gate ──> write + flush (retried)
//! ```
//!
//! A snapshot larger than `envelope_records_max` or `envelope_bytes_max` is
//! written as several envelopes, in order. A single body that cannot fit any
//! envelope is dropped by the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sluice_core::{BatchId, Limits, PartitionIndex, RecordBody};
use sluice_routing::{Partition, PartitionSet};
use tracing::{debug, error, warn};

use crate::cache::MergeStrategy;
use crate::collaborators::Producer;
use crate::compression::CompressionGate;
use crate::config::ExhaustedWritePolicy;
use crate::envelope::{PartialEnvelope, ShuffleEnvelopeBuilder, WireEnvelope, FRAME_HEADER_SIZE};
use crate::error::ProducerError;
use crate::provenance::ORIGIN_REQUEST_ID;
use crate::retry::RetryPolicy;
use crate::stage::StageStatus;
use crate::stats::ShuffleStats;

/// Length prefixes of the larger (compressed) body layout.
const BODY_PREFIX_BYTES: usize = 5 * 4;

/// Turns a partition snapshot into written envelopes.
pub struct EnvelopeMerge {
    partitions: PartitionSet,
    builder: ShuffleEnvelopeBuilder,
    gate: CompressionGate,
    producer: Arc<dyn Producer>,
    retry: RetryPolicy,
    exhausted: ExhaustedWritePolicy,
    stats: Arc<ShuffleStats>,
    status: Arc<StageStatus>,
    records_max: usize,
    bytes_max: usize,
    next_batch: AtomicU64,
}

impl EnvelopeMerge {
    /// Creates a merge step writing to `producer`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partitions: PartitionSet,
        builder: ShuffleEnvelopeBuilder,
        gate: CompressionGate,
        producer: Arc<dyn Producer>,
        retry: RetryPolicy,
        exhausted: ExhaustedWritePolicy,
        stats: Arc<ShuffleStats>,
        status: Arc<StageStatus>,
        limits: &Limits,
    ) -> Self {
        Self {
            partitions,
            builder,
            gate,
            producer,
            retry,
            exhausted,
            stats,
            status,
            records_max: (limits.envelope_records_max as usize).max(1),
            bytes_max: limits.envelope_bytes_max as usize,
            next_batch: AtomicU64::new(1),
        }
    }

    /// Splits bodies into runs that each fit one envelope.
    ///
    /// Each body is charged its encoded size plus its share of the joined
    /// trace id, so the estimate never undercounts a plain frame.
    fn split(&self, partition_id: &str, messages: Vec<RecordBody>) -> Vec<Vec<RecordBody>> {
        let overhead = FRAME_HEADER_SIZE
            + BODY_PREFIX_BYTES
            + partition_id.len()
            + self.builder.owner_id().len();
        let budget = self.bytes_max.saturating_sub(overhead);

        let mut chunks = Vec::new();
        let mut chunk: Vec<RecordBody> = Vec::new();
        let mut chunk_bytes = 0;
        for body in messages {
            let cost = body.encoded_size()
                + body.get_str(ORIGIN_REQUEST_ID).map_or(0, |t| t.len() + 1);
            let full = chunk.len() >= self.records_max || chunk_bytes + cost > budget;
            if !chunk.is_empty() && full {
                chunks.push(std::mem::take(&mut chunk));
                chunk_bytes = 0;
            }
            chunk_bytes += cost;
            chunk.push(body);
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        chunks
    }

    fn write(
        &self,
        wire: &WireEnvelope,
        partition: &Partition,
        batch: BatchId,
    ) -> Result<(), ProducerError> {
        let on_retry = |attempt: u32, err: &ProducerError| {
            ShuffleStats::add(&self.stats.write_retries, 1);
            warn!(
                partition = %partition.id,
                batch = %batch,
                attempt,
                max_attempts = self.retry.max_attempts(),
                error = %err,
                "Shuffle write failed, retrying"
            );
        };
        self.retry.run(|| self.producer.write(wire, partition), on_retry)?;
        self.retry.run(|| self.producer.flush(partition), on_retry)
    }

    fn on_write_failure(
        &self,
        partition: &Partition,
        batch: BatchId,
        records: usize,
        err: &ProducerError,
    ) {
        self.stats.record_drop(records);
        let escalate = !err.is_transient() || self.exhausted == ExhaustedWritePolicy::Escalate;
        error!(
            partition = %partition.id,
            batch = %batch,
            records,
            escalate,
            error = %err,
            "Dropping shuffle batch after write failure"
        );
        if escalate {
            self.status
                .mark_unhealthy(format!("write to {} failed: {err}", partition.id));
        }
    }

    /// Builds, compresses, and writes one envelope. Returns records delivered.
    fn write_envelope(&self, partition: &Partition, messages: Vec<RecordBody>) -> usize {
        let batch = BatchId::new(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let records = messages.len();

        let envelope = self.builder.build(&partition.id, messages);
        let wire = match self.gate.maybe_compress(envelope) {
            Ok(wire) => wire,
            Err(err) => {
                ShuffleStats::add(&self.stats.compression_failures, 1);
                self.stats.record_drop(records);
                error!(
                    partition = %partition.id,
                    batch = %batch,
                    records,
                    error = %err,
                    "Dropping shuffle batch, compression failed"
                );
                return 0;
            }
        };

        if let Err(err) = self.write(&wire, partition, batch) {
            self.on_write_failure(partition, batch, records, &err);
            return 0;
        }

        let bytes = wire.encoded_len() as u64;
        ShuffleStats::add(&self.stats.envelopes_written, 1);
        ShuffleStats::add(&self.stats.records_written, records as u64);
        ShuffleStats::add(&self.stats.bytes_written, bytes);
        if wire.is_compressed() {
            ShuffleStats::add(&self.stats.envelopes_compressed, 1);
        }
        debug!(
            partition = %partition.id,
            batch = %batch,
            records,
            bytes,
            codec = wire.codec().as_str(),
            "Wrote shuffle envelope"
        );
        records
    }
}

impl MergeStrategy<PartialEnvelope> for EnvelopeMerge {
    fn merge(&self, index: PartitionIndex, entries: Vec<PartialEnvelope>) -> usize {
        let messages: Vec<RecordBody> = entries
            .into_iter()
            .flat_map(PartialEnvelope::into_bodies)
            .collect();
        let records = messages.len();

        let partition = match self.partitions.get(index) {
            Ok(partition) => partition,
            Err(err) => {
                error!(
                    records,
                    error = %err,
                    "Dropping shuffle batch for unknown partition"
                );
                self.stats.record_drop(records);
                return 0;
            }
        };

        let chunks = self.split(&partition.id, messages);
        if chunks.len() > 1 {
            debug!(
                partition = %partition.id,
                records,
                envelopes = chunks.len(),
                "Splitting shuffle batch to fit envelope limits"
            );
        }
        chunks
            .into_iter()
            .map(|chunk| self.write_envelope(partition, chunk))
            .sum()
    }
}
