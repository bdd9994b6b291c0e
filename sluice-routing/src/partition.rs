//! Partition topology - the fixed, ordered list of shuffle destinations.
//!
//! A topology is scoped by the pipeline source, namespace, stage name, owner
//! name, and split count. Two independently configured shuffle stages get
//! disjoint partition ids even when they share a pipeline.

use sluice_core::{Limits, PartitionIndex};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{RoutingError, RoutingResult};

/// Identity of one shuffle topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyScope {
    /// Identity of the pipeline's source.
    pub source_identity: String,
    /// Pipeline namespace.
    pub namespace: String,
    /// Name of the owning stage.
    pub stage_name: String,
    /// Owner of the shuffle (for windows: window + group + version).
    pub owner_name: String,
    /// Number of destination partitions.
    pub split_count: u32,
}

impl TopologyScope {
    /// Creates a scope.
    #[must_use]
    pub fn new(
        source_identity: impl Into<String>,
        namespace: impl Into<String>,
        stage_name: impl Into<String>,
        owner_name: impl Into<String>,
        split_count: u32,
    ) -> Self {
        Self {
            source_identity: source_identity.into(),
            namespace: namespace.into(),
            stage_name: stage_name.into(),
            owner_name: owner_name.into(),
            split_count,
        }
    }

    /// Validates the scope against the limits.
    ///
    /// # Errors
    /// Returns an error if a component is empty or the split count is out of range.
    pub fn validate(&self, limits: &Limits) -> RoutingResult<()> {
        for (field, value) in [
            ("source_identity", &self.source_identity),
            ("namespace", &self.namespace),
            ("stage_name", &self.stage_name),
            ("owner_name", &self.owner_name),
        ] {
            if value.is_empty() {
                return Err(RoutingError::EmptyScopeField { field });
            }
        }
        limits
            .check_split_count(self.split_count)
            .map_err(|e| RoutingError::InvalidSplitCount {
                split_count: self.split_count,
                reason: e.to_string(),
            })
    }

    /// Returns the topic name shared by every partition of this topology.
    #[must_use]
    pub fn topic_name(&self) -> String {
        format!(
            "{}.{}.{}.{}.s{}",
            self.namespace, self.stage_name, self.owner_name, self.source_identity, self.split_count
        )
    }

    /// Returns the stable id of the partition at `index`.
    #[must_use]
    pub fn partition_id(&self, index: PartitionIndex) -> String {
        format!("{}#{:04}", self.topic_name(), index.get())
    }
}

/// One destination unit of the repartitioned stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Stable id, unique across topologies.
    pub id: String,
    /// Position in the ordered partition list.
    pub index: PartitionIndex,
}

/// The ordered, immutable partition list of one topology.
#[derive(Debug, Clone)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
}

impl PartitionSet {
    /// Creates the partitions for a scope, ids derived from the scope.
    #[must_use]
    pub fn for_scope(scope: &TopologyScope) -> Self {
        let partitions = (0..u64::from(scope.split_count))
            .map(PartitionIndex::new)
            .map(|index| Partition {
                id: scope.partition_id(index),
                index,
            })
            .collect();
        Self { partitions }
    }

    /// Creates a set from explicit ids, indexed in order.
    ///
    /// # Errors
    /// Returns an error if `ids` is empty.
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> RoutingResult<Self> {
        let partitions: Vec<Partition> = ids
            .into_iter()
            .zip(0_u64..)
            .map(|(id, i)| Partition {
                id,
                index: PartitionIndex::new(i),
            })
            .collect();
        if partitions.is_empty() {
            return Err(RoutingError::InvalidSplitCount {
                split_count: 0,
                reason: "partition list is empty".to_string(),
            });
        }
        Ok(Self { partitions })
    }

    /// Returns the number of partitions.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Bounded by Limits::split_count_max.
    pub fn split_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Returns the partition at `index`.
    ///
    /// # Errors
    /// Returns an error if `index` is outside the topology.
    pub fn get(&self, index: PartitionIndex) -> RoutingResult<&Partition> {
        self.partitions
            .get(index.as_usize())
            .ok_or(RoutingError::PartitionOutOfRange {
                index: index.get(),
                split_count: self.split_count(),
            })
    }

    /// Iterates over partitions in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }
}

/// Maps a shuffle key to a raw hash.
///
/// The topology reduces the hash modulo its split count, so implementations
/// only need to be deterministic for the lifetime of a stage.
pub trait Partitioner: Send + Sync + std::fmt::Debug {
    /// Hashes a key.
    fn hash_key(&self, key: &str) -> u64;
}

/// xxh3-based partitioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn hash_key(&self, key: &str) -> u64 {
        xxh3_64(key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(owner: &str, split_count: u32) -> TopologyScope {
        TopologyScope::new("orders-source", "prod", "shuffle-stage", owner, split_count)
    }

    #[test]
    fn test_partition_set_for_scope() {
        let set = PartitionSet::for_scope(&scope("win_a", 3));
        assert_eq!(set.split_count(), 3);

        let indexes: Vec<u64> = set.iter().map(|p| p.index.get()).collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        let p1 = set.get(PartitionIndex::new(1)).unwrap();
        assert_eq!(p1.id, "prod.shuffle-stage.win_a.orders-source.s3#0001");
    }

    #[test]
    fn test_partition_ids_disjoint_across_owners() {
        let a = PartitionSet::for_scope(&scope("win_a", 2));
        let b = PartitionSet::for_scope(&scope("win_b", 2));

        for pa in a.iter() {
            assert!(b.iter().all(|pb| pb.id != pa.id));
        }
    }

    #[test]
    fn test_partition_out_of_range() {
        let set = PartitionSet::for_scope(&scope("win_a", 2));
        assert_eq!(
            set.get(PartitionIndex::new(2)).unwrap_err(),
            RoutingError::PartitionOutOfRange {
                index: 2,
                split_count: 2,
            }
        );
    }

    #[test]
    fn test_scope_validation() {
        let limits = Limits::new();
        assert!(scope("win_a", 4).validate(&limits).is_ok());
        assert_eq!(
            scope("", 4).validate(&limits).unwrap_err(),
            RoutingError::EmptyScopeField {
                field: "owner_name"
            }
        );
        assert!(matches!(
            scope("win_a", 0).validate(&limits),
            Err(RoutingError::InvalidSplitCount { split_count: 0, .. })
        ));
    }

    #[test]
    fn test_from_ids_rejects_empty() {
        assert!(PartitionSet::from_ids(Vec::new()).is_err());
        let set = PartitionSet::from_ids(vec!["q0".to_string(), "q1".to_string()]).unwrap();
        assert_eq!(set.get(PartitionIndex::new(1)).unwrap().id, "q1");
    }

    #[test]
    fn test_hash_partitioner_deterministic() {
        let p = HashPartitioner;
        assert_eq!(p.hash_key("user-123"), p.hash_key("user-123"));
        assert_ne!(p.hash_key("user-123"), p.hash_key("user-456"));
    }
}
