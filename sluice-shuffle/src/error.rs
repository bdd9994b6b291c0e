//! Shuffle stage error types.

use sluice_core::{CodecError, Compression};
use sluice_routing::RoutingError;

use crate::stage::StageState;

/// Shuffle stage error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShuffleError {
    /// The stage is not in a state that accepts the operation.
    #[error("stage not ready: in {state}, need {required}")]
    NotReady {
        /// The current state.
        state: StageState,
        /// The state the operation requires.
        required: StageState,
    },

    /// The stage hit a fatal error and stopped accepting records.
    #[error("stage unhealthy: {reason}")]
    Unhealthy {
        /// What made the stage unhealthy.
        reason: String,
    },

    /// The configuration is malformed.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// The configured window could not be resolved.
    #[error("window '{name}' not found")]
    WindowNotFound {
        /// The configured window name.
        name: String,
    },

    /// The partition topology or producer could not be created.
    #[error("topology creation failed for '{topic}': {message}")]
    Topology {
        /// Topic name of the topology.
        topic: String,
        /// Error message.
        message: String,
    },

    /// A routing error.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// An envelope could not be decoded.
    #[error("envelope codec error: {0}")]
    Codec(#[from] CodecError),

    /// An envelope could not be compressed or decompressed.
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

impl From<sluice_core::Error> for ShuffleError {
    fn from(err: sluice_core::Error) -> Self {
        Self::InvalidConfig {
            message: err.to_string(),
        }
    }
}

/// Result type for shuffle stage operations.
pub type ShuffleResult<T> = Result<T, ShuffleError>;

/// Errors reported by a transport producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProducerError {
    /// The write may succeed if retried.
    #[error("transient write error on {partition_id}: {message}")]
    Transient {
        /// Destination partition.
        partition_id: String,
        /// Error message.
        message: String,
    },

    /// The producer cannot make progress.
    #[error("fatal producer error on {partition_id}: {message}")]
    Fatal {
        /// Destination partition.
        partition_id: String,
        /// Error message.
        message: String,
    },
}

impl ProducerError {
    /// Returns true if the operation may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Compression gate errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    /// The codec failed.
    #[error("{} codec failed: {message}", codec.as_str())]
    Codec {
        /// The codec in use.
        codec: Compression,
        /// Error message.
        message: String,
    },

    /// The envelope is too large to send.
    #[error("envelope of {size} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Envelope size on the wire.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// A window callback failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("window '{window}' failed: {message}")]
pub struct WindowError {
    /// Window name.
    pub window: String,
    /// Error message.
    pub message: String,
}

impl WindowError {
    /// Creates a window error.
    #[must_use]
    pub fn new(window: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            window: window.into(),
            message: message.into(),
        }
    }
}
