//! Typed integers for partition positions and merge batches.

use std::fmt;

macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

define_id!(
    PartitionIndex,
    "split",
    "Position of a destination partition in the ordered partition list."
);
define_id!(
    BatchId,
    "batch",
    "Stage-wide sequence number of a written envelope, used in logs."
);

impl PartitionIndex {
    /// Returns the index as a cache slot position.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Bounded by Limits::split_count_max.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}
