//! Contracts the shuffle stage consumes from the rest of the pipeline.
//!
//! The stage never constructs these itself: windows come from a registry,
//! the topology and producer from a creator, and the downstream stage from
//! the pipeline by label.

use std::sync::Arc;

use sluice_routing::{Partition, PartitionSet, Partitioner, ShuffleKeySource, TopologyScope};

use crate::envelope::WireEnvelope;
use crate::error::{ProducerError, ShuffleResult, WindowError};

/// A stateful aggregator fed in parallel with shuffling.
///
/// The grouping key comes from [`ShuffleKeySource::shuffle_key`].
pub trait Window: ShuffleKeySource {
    /// Returns the window's name.
    fn name(&self) -> &str;

    /// Accumulates one record into the window.
    ///
    /// # Errors
    /// Returns an error if the window rejects the record.
    fn do_message(&self, record: &sluice_core::Record) -> Result<(), WindowError>;
}

/// Resolves windows by name.
pub trait WindowRegistry: Send + Sync {
    /// Returns the window named `name`, if registered.
    fn window(&self, name: &str) -> Option<Arc<dyn Window>>;
}

/// Transport that carries envelopes to partitions.
pub trait Producer: Send + Sync {
    /// Writes an envelope to a partition.
    ///
    /// # Errors
    /// Returns an error if the write failed.
    fn write(&self, envelope: &WireEnvelope, partition: &Partition) -> Result<(), ProducerError>;

    /// Flushes buffered writes for a partition.
    ///
    /// # Errors
    /// Returns an error if the flush failed.
    fn flush(&self, partition: &Partition) -> Result<(), ProducerError>;

    /// Releases transport resources.
    fn close(&self) {}
}

/// Everything a stage needs to route and write.
#[derive(Clone)]
pub struct ShuffleTopology {
    /// The ordered partition list.
    pub partitions: PartitionSet,
    /// Key hash.
    pub partitioner: Arc<dyn Partitioner>,
    /// Writer for envelopes.
    pub producer: Arc<dyn Producer>,
}

impl std::fmt::Debug for ShuffleTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShuffleTopology")
            .field("split_count", &self.partitions.split_count())
            .field("partitioner", &self.partitioner)
            .finish_non_exhaustive()
    }
}

/// Materializes the partition topology and producer for a scope.
pub trait TopologyCreator: Send + Sync {
    /// Creates the topology.
    ///
    /// # Errors
    /// Returns [`crate::ShuffleError::Topology`] if it cannot be created.
    fn create(&self, scope: &TopologyScope) -> ShuffleResult<ShuffleTopology>;
}

/// In-process signals delivered to a downstream stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Upstream produced its first batch; carries no data.
    ConsumerStart,
}

/// A stage that can receive control signals.
pub trait DownstreamStage: Send + Sync {
    /// Handles a control signal.
    fn on_control(&self, signal: ControlSignal);
}

/// The stage graph, queried by label.
pub trait Pipeline: Send + Sync {
    /// Returns the stage with the given label.
    fn stage_by_label(&self, label: &str) -> Option<Arc<dyn DownstreamStage>>;
}
