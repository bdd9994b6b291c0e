//! Sluice Core - Strongly-typed identifiers, limits, and the record model.
//!
//! This crate holds the types shared by every stage of the shuffle pipeline:
//! the inbound [`Record`] (header plus ordered body), the partition and batch
//! identifiers, the codec enum, and the system-wide [`Limits`].
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a partition index with a batch id
//! - **Explicit limits**: Every buffer and envelope has a bounded maximum
//! - **Self-describing encodings**: Every encoded value carries its type tag
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod error;
mod limits;
mod record;
mod types;

pub use error::{CodecError, Error, Result};
pub use limits::Limits;
pub use record::{Compression, FieldValue, Record, RecordBody, RecordHeader};
pub use types::{BatchId, PartitionIndex};
