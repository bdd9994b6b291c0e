//! Routing error types.

/// Routing error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    /// The split count is outside the allowed range.
    #[error("invalid split count {split_count}: {reason}")]
    InvalidSplitCount {
        /// The rejected split count.
        split_count: u32,
        /// Why it was rejected.
        reason: String,
    },

    /// A topology scope component was empty.
    #[error("topology scope field '{field}' must not be empty")]
    EmptyScopeField {
        /// The empty field.
        field: &'static str,
    },

    /// A partition index was outside the topology.
    #[error("partition index {index} out of range (split count {split_count})")]
    PartitionOutOfRange {
        /// The requested index.
        index: u64,
        /// Number of partitions.
        split_count: u32,
    },
}

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;
