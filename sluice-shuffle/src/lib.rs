//! Sluice Shuffle - The repartitioning stage of a stream pipeline.
//!
//! This crate routes inbound records to a fixed set of destination
//! partitions, batches records per partition, and writes merged envelopes to
//! a transport producer:
//!
//! ```text
//! ingest ──> window.do_message ──> resolve key ──> stamp provenance ──> cache.append
//!                                                                           │
//!             producer.write <── compression gate <── build envelope <── flush (merge once)
//! ```
//!
//! # Design (`TigerStyle`)
//!
//! - **No global locks on ingest**: Only per-partition flushes are serialized
//! - **Exactly-once merge**: Each flushed snapshot is merged exactly once
//! - **Atomic reconfigure**: Readers see a complete snapshot or the previous one
//! - **Bounded everything**: Envelope size, record count, and retries have limits

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod collaborators;
pub mod compression;
mod config;
mod envelope;
mod error;
mod flusher;
pub mod memory;
mod merge;
mod notifier;
pub mod provenance;
mod retry;
mod stage;
mod stats;

pub use cache::{CacheEntry, FlushOutcome, FlushReport, MergeStrategy, PartitionedMessageCache};
pub use collaborators::{
    ControlSignal, DownstreamStage, Pipeline, Producer, ShuffleTopology, TopologyCreator, Window,
    WindowRegistry,
};
pub use compression::CompressionGate;
pub use config::{
    CompressionConfig, ExhaustedWritePolicy, FlushPolicy, RetryConfig, ShuffleConfig,
    ENV_FLUSH_LINGER_MS, ENV_WINDOW_FIRE_TEST,
};
pub use envelope::{
    CompressedEnvelope, Envelope, PartialEnvelope, ShuffleEnvelopeBuilder, WireEnvelope,
    ENVELOPE_MAGIC, ENVELOPE_VERSION,
};
pub use error::{CompressionError, ProducerError, ShuffleError, ShuffleResult, WindowError};
pub use flusher::LingerFlusher;
pub use merge::EnvelopeMerge;
pub use notifier::ConsumerStartNotifier;
pub use provenance::Provenance;
pub use retry::RetryPolicy;
pub use stage::{IngestSummary, ShuffleStage, StageContext, StageState, StageStatus};
pub use stats::{ShuffleStats, ShuffleStatsSnapshot};
