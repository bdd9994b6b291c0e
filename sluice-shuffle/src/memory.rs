//! In-memory collaborators for tests, benchmarks, and local runs.
//!
//! [`MemoryProducer`] keeps every encoded frame it is handed, so callers can
//! decode exactly what would have gone over the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use sluice_core::{Limits, Record};
use sluice_routing::{HashPartitioner, Partition, PartitionSet, ShuffleKeySource, TopologyScope};

use crate::collaborators::{
    DownstreamStage, Pipeline, Producer, ShuffleTopology, TopologyCreator, Window, WindowRegistry,
};
use crate::compression;
use crate::envelope::{Envelope, WireEnvelope};
use crate::error::{ProducerError, ShuffleError, ShuffleResult, WindowError};

/// Producer that records encoded frames in memory.
#[derive(Debug, Default)]
pub struct MemoryProducer {
    frames: Mutex<Vec<(String, Bytes)>>,
    flushes: AtomicU64,
    transient_failures: AtomicU32,
    fatal: AtomicBool,
    closed: AtomicBool,
}

impl MemoryProducer {
    /// Creates an empty producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` writes with a transient error.
    pub fn inject_transient_failures(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fails every write with a fatal error while set.
    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    /// Returns true once `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of successful flush calls.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Returns `(partition id, frame)` pairs in write order.
    #[must_use]
    pub fn frames(&self) -> Vec<(String, Bytes)> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decodes and decompresses every written frame.
    ///
    /// # Errors
    /// Returns an error if a frame fails to decode.
    pub fn envelopes(&self, limits: &Limits) -> ShuffleResult<Vec<(String, Envelope)>> {
        self.frames()
            .into_iter()
            .map(|(partition, frame)| -> ShuffleResult<(String, Envelope)> {
                let wire = WireEnvelope::decode(frame, limits)?;
                Ok((partition, compression::open(wire, limits)?))
            })
            .collect()
    }

    /// Counts records across every written envelope.
    ///
    /// # Errors
    /// Returns an error if a frame fails to decode.
    pub fn record_count(&self, limits: &Limits) -> ShuffleResult<usize> {
        Ok(self
            .envelopes(limits)?
            .iter()
            .map(|(_, e)| e.messages.len())
            .sum())
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Producer for MemoryProducer {
    fn write(&self, envelope: &WireEnvelope, partition: &Partition) -> Result<(), ProducerError> {
        if self.fatal.load(Ordering::SeqCst) || self.is_closed() {
            return Err(ProducerError::Fatal {
                partition_id: partition.id.clone(),
                message: "producer unavailable".to_string(),
            });
        }
        if self.take_transient_failure() {
            return Err(ProducerError::Transient {
                partition_id: partition.id.clone(),
                message: "injected failure".to_string(),
            });
        }
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((partition.id.clone(), envelope.encode()));
        Ok(())
    }

    fn flush(&self, _partition: &Partition) -> Result<(), ProducerError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Topology creator backed by a shared [`MemoryProducer`].
#[derive(Debug, Default)]
pub struct MemoryTopologyCreator {
    producer: Arc<MemoryProducer>,
    creations: AtomicU32,
    fail_next: AtomicBool,
}

impl MemoryTopologyCreator {
    /// Creates a creator with a fresh producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the producer handed to every topology.
    #[must_use]
    pub fn producer(&self) -> Arc<MemoryProducer> {
        Arc::clone(&self.producer)
    }

    /// Returns the number of successful `create` calls.
    #[must_use]
    pub fn creations(&self) -> u32 {
        self.creations.load(Ordering::SeqCst)
    }

    /// Makes the next `create` call fail.
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TopologyCreator for MemoryTopologyCreator {
    fn create(&self, scope: &TopologyScope) -> ShuffleResult<ShuffleTopology> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ShuffleError::Topology {
                topic: scope.topic_name(),
                message: "injected failure".to_string(),
            });
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(ShuffleTopology {
            partitions: PartitionSet::for_scope(scope),
            partitioner: Arc::new(HashPartitioner),
            producer: Arc::clone(&self.producer) as Arc<dyn Producer>,
        })
    }
}

/// Window keyed by one string field of the record body.
///
/// Counts the records it accumulates. See [`FieldKeyWindow::rejecting`] for
/// injecting window failures.
#[derive(Debug)]
pub struct FieldKeyWindow {
    name: String,
    field: String,
    accepted: AtomicU64,
    reject_offsets: Vec<String>,
}

impl FieldKeyWindow {
    /// Creates a window grouping by `field`.
    #[must_use]
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            accepted: AtomicU64::new(0),
            reject_offsets: Vec::new(),
        }
    }

    /// Rejects records with the given origin offsets.
    #[must_use]
    pub fn rejecting(mut self, offsets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.reject_offsets = offsets.into_iter().map(Into::into).collect();
        self
    }

    /// Records accumulated so far.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl ShuffleKeySource for FieldKeyWindow {
    fn shuffle_key(&self, record: &Record) -> String {
        record
            .body
            .get_str(&self.field)
            .unwrap_or_default()
            .to_string()
    }
}

impl Window for FieldKeyWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn do_message(&self, record: &Record) -> Result<(), WindowError> {
        if self.reject_offsets.contains(&record.header.offset) {
            return Err(WindowError::new(
                &self.name,
                format!("rejected offset {}", record.header.offset),
            ));
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Window registry backed by a map.
#[derive(Default)]
pub struct MemoryWindowRegistry {
    windows: RwLock<HashMap<String, Arc<dyn Window>>>,
}

impl MemoryWindowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a window under its name.
    pub fn register(&self, window: Arc<dyn Window>) {
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(window.name().to_string(), window);
    }
}

impl WindowRegistry for MemoryWindowRegistry {
    fn window(&self, name: &str) -> Option<Arc<dyn Window>> {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Pipeline backed by a label map.
#[derive(Default)]
pub struct MemoryPipeline {
    stages: RwLock<HashMap<String, Arc<dyn DownstreamStage>>>,
}

impl MemoryPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage under `label`.
    pub fn add_stage(&self, label: impl Into<String>, stage: Arc<dyn DownstreamStage>) {
        self.stages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.into(), stage);
    }
}

impl Pipeline for MemoryPipeline {
    fn stage_by_label(&self, label: &str) -> Option<Arc<dyn DownstreamStage>> {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned()
    }
}
