//! Sluice Routing - Shuffle key resolution and partition topology.
//!
//! This crate maps records to destination partitions:
//!
//! ```text
//! Record ──> PartitionKeyResolver::resolve ──> key ──> Partitioner ──> PartitionIndex
//!               (window key or fallback)          (xxh3 % split_count)
//! ```
//!
//! # Design (`TigerStyle`)
//!
//! - **Deterministic hashing**: The same key always maps to the same index
//! - **Fixed topology**: The partition list never changes once created
//! - **Reproducible fallback**: Ungrouped records use a seedable generator

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod partition;
mod resolver;

pub use error::{RoutingError, RoutingResult};
pub use partition::{HashPartitioner, Partition, PartitionSet, Partitioner, TopologyScope};
pub use resolver::{
    FallbackKeys, PartitionKeyResolver, ResolvedKey, ShuffleKeySource, NULL_SHUFFLE_KEY,
};
