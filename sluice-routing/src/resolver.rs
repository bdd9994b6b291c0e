//! Shuffle key resolution - routes each record to a partition index.
//!
//! With a window configured the key comes from the window's grouping fields,
//! so records of one group always land on the same partition. Without a
//! window, keys are drawn from `{1..=split_count}` purely to spread load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_core::{PartitionIndex, Record};
use tracing::debug;

use crate::partition::Partitioner;

/// Key substituted when the resolved key is empty.
pub const NULL_SHUFFLE_KEY: &str = "<null>";

/// Produces grouping keys for records.
pub trait ShuffleKeySource: Send + Sync {
    /// Returns the grouping key of a record, possibly empty.
    fn shuffle_key(&self, record: &Record) -> String;
}

/// Key generator for records with no grouping source.
#[derive(Debug)]
pub enum FallbackKeys {
    /// Uniform draw over `{1..=split_count}`.
    Random(Mutex<ChaCha8Rng>),
    /// Cycles through `{1..=split_count}`.
    RoundRobin(AtomicU64),
}

impl FallbackKeys {
    /// Uniform keys; seeded for reproducible runs, entropy-seeded otherwise.
    #[must_use]
    pub fn random(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(ChaCha8Rng::from_entropy, ChaCha8Rng::seed_from_u64);
        Self::Random(Mutex::new(rng))
    }

    /// Round-robin keys starting at 1.
    #[must_use]
    pub const fn round_robin() -> Self {
        Self::RoundRobin(AtomicU64::new(0))
    }

    fn next_key(&self, split_count: u32) -> String {
        let n = u64::from(split_count.max(1));
        let value = match self {
            Self::Random(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_range(1..=n),
            Self::RoundRobin(counter) => counter.fetch_add(1, Ordering::Relaxed) % n + 1,
        };
        value.to_string()
    }
}

/// Outcome of key resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// The key to hash.
    pub key: String,
    /// True if the sentinel was substituted for an empty key.
    pub substituted: bool,
}

/// Resolves shuffle keys and maps them onto the fixed partition range.
#[derive(Debug)]
pub struct PartitionKeyResolver {
    split_count: u32,
    fallback: FallbackKeys,
    partitioner: Arc<dyn Partitioner>,
}

impl PartitionKeyResolver {
    /// Creates a resolver for a topology of `split_count` partitions.
    ///
    /// # Panics
    /// Panics if `split_count` is zero.
    #[must_use]
    pub fn new(split_count: u32, fallback: FallbackKeys, partitioner: Arc<dyn Partitioner>) -> Self {
        assert!(split_count > 0, "split count must be positive");
        Self {
            split_count,
            fallback,
            partitioner,
        }
    }

    /// Returns the number of partitions keys are mapped onto.
    #[must_use]
    pub const fn split_count(&self) -> u32 {
        self.split_count
    }

    /// Derives the routing key of a record.
    ///
    /// Never fails: an empty key becomes [`NULL_SHUFFLE_KEY`] and the record
    /// is still routed.
    pub fn resolve<S>(&self, record: &Record, source: Option<&S>) -> ResolvedKey
    where
        S: ShuffleKeySource + ?Sized,
    {
        let key = match source {
            Some(source) => source.shuffle_key(record),
            None => self.fallback.next_key(self.split_count),
        };

        if key.is_empty() {
            debug!(
                queue_id = %record.header.queue_id,
                offset = %record.header.offset,
                "No group by value in record, using null shuffle key"
            );
            return ResolvedKey {
                key: NULL_SHUFFLE_KEY.to_string(),
                substituted: true,
            };
        }

        ResolvedKey {
            key,
            substituted: false,
        }
    }

    /// Maps a key to its partition index, always in `[0, split_count)`.
    #[must_use]
    pub fn to_index(&self, key: &str) -> PartitionIndex {
        PartitionIndex::new(self.partitioner.hash_key(key) % u64::from(self.split_count))
    }
}
