//! Delivery properties checked against written envelopes.
//!
//! Every non-system record sent must come out of exactly one envelope, every
//! shuffle key must map to exactly one partition, and records from one queue
//! must keep their offset order within a partition.

use std::collections::{BTreeMap, BTreeSet};

use sluice_core::Record;
use sluice_shuffle::{Envelope, Provenance};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a shuffle delivery property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// A sent record never reached an envelope.
    Lost {
        /// Origin queue id.
        queue_id: String,
        /// Origin offset.
        offset: String,
    },
    /// A record reached more than one envelope slot.
    Duplicated {
        /// Origin queue id.
        queue_id: String,
        /// Origin offset.
        offset: String,
        /// Times it was delivered.
        copies: usize,
    },
    /// A system record was shuffled.
    SystemRecordDelivered {
        /// Origin queue id.
        queue_id: String,
        /// Origin offset.
        offset: String,
    },
    /// A delivered record was never sent.
    Unknown {
        /// Origin queue id.
        queue_id: String,
        /// Origin offset.
        offset: String,
    },
    /// A delivered body carries no provenance.
    Unstamped {
        /// Partition the body was written to.
        partition_id: String,
    },
    /// One shuffle key was written to several partitions.
    SplitKey {
        /// The key.
        shuffle_key: String,
        /// Partitions it appeared in.
        partitions: Vec<String>,
    },
    /// Offsets from one queue went backwards within a partition.
    OutOfOrder {
        /// Partition id.
        partition_id: String,
        /// Origin queue id.
        queue_id: String,
        /// Offset seen before.
        previous: u64,
        /// Offset seen after it.
        offset: u64,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lost { queue_id, offset } => write!(f, "Record {queue_id}@{offset} was lost"),
            Self::Duplicated {
                queue_id,
                offset,
                copies,
            } => write!(f, "Record {queue_id}@{offset} delivered {copies} times"),
            Self::SystemRecordDelivered { queue_id, offset } => {
                write!(f, "System record {queue_id}@{offset} was shuffled")
            }
            Self::Unknown { queue_id, offset } => {
                write!(f, "Record {queue_id}@{offset} delivered but never sent")
            }
            Self::Unstamped { partition_id } => {
                write!(f, "Body without provenance in partition {partition_id}")
            }
            Self::SplitKey {
                shuffle_key,
                partitions,
            } => write!(f, "Key {shuffle_key:?} split across {partitions:?}"),
            Self::OutOfOrder {
                partition_id,
                queue_id,
                previous,
                offset,
            } => write!(
                f,
                "Partition {partition_id}: queue {queue_id} offset {offset} after {previous}"
            ),
        }
    }
}

// ============================================================================
// Delivery Checker
// ============================================================================

type Origin = (String, String);

/// Tracks sent records and checks what the producer received.
#[derive(Debug, Default)]
pub struct DeliveryChecker {
    expected: BTreeSet<Origin>,
    system: BTreeSet<Origin>,
}

impl DeliveryChecker {
    /// Creates an empty checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a batch handed to `ingest`.
    pub fn record_sent(&mut self, records: &[Record]) {
        for record in records {
            let origin = (record.header.queue_id.clone(), record.header.offset.clone());
            if record.is_system_message() {
                self.system.insert(origin);
            } else {
                self.expected.insert(origin);
            }
        }
    }

    /// Merges another checker's sent records into this one.
    pub fn absorb(&mut self, other: Self) {
        self.expected.extend(other.expected);
        self.system.extend(other.system);
    }

    /// Non-system records sent so far.
    #[must_use]
    pub fn expected_records(&self) -> usize {
        self.expected.len()
    }

    /// System records sent so far.
    #[must_use]
    pub fn system_records(&self) -> usize {
        self.system.len()
    }

    /// Checks envelopes in write order. Returns every violation found.
    #[must_use]
    pub fn check(&self, delivered: &[(String, Envelope)]) -> Vec<PropertyViolation> {
        let mut violations = Vec::new();
        let mut copies: BTreeMap<Origin, usize> = BTreeMap::new();
        let mut key_partitions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut last_offset: BTreeMap<(String, String), u64> = BTreeMap::new();

        for (partition_id, envelope) in delivered {
            for body in &envelope.messages {
                let Some(provenance) = Provenance::from_body(body) else {
                    violations.push(PropertyViolation::Unstamped {
                        partition_id: partition_id.clone(),
                    });
                    continue;
                };

                key_partitions
                    .entry(provenance.shuffle_key.clone())
                    .or_default()
                    .insert(partition_id.clone());

                if let Ok(offset) = provenance.offset.parse::<u64>() {
                    let slot = (partition_id.clone(), provenance.queue_id.clone());
                    if let Some(&previous) = last_offset.get(&slot) {
                        if offset < previous {
                            violations.push(PropertyViolation::OutOfOrder {
                                partition_id: partition_id.clone(),
                                queue_id: provenance.queue_id.clone(),
                                previous,
                                offset,
                            });
                        }
                    }
                    last_offset.insert(slot, offset);
                }

                *copies
                    .entry((provenance.queue_id, provenance.offset))
                    .or_default() += 1;
            }
        }

        for (origin, &count) in &copies {
            let (queue_id, offset) = origin.clone();
            if self.system.contains(origin) {
                violations.push(PropertyViolation::SystemRecordDelivered { queue_id, offset });
            } else if !self.expected.contains(origin) {
                violations.push(PropertyViolation::Unknown { queue_id, offset });
            } else if count > 1 {
                violations.push(PropertyViolation::Duplicated {
                    queue_id,
                    offset,
                    copies: count,
                });
            }
        }

        for origin in &self.expected {
            if !copies.contains_key(origin) {
                let (queue_id, offset) = origin.clone();
                violations.push(PropertyViolation::Lost { queue_id, offset });
            }
        }

        for (shuffle_key, partitions) in key_partitions {
            if partitions.len() > 1 {
                violations.push(PropertyViolation::SplitKey {
                    shuffle_key,
                    partitions: partitions.into_iter().collect(),
                });
            }
        }

        violations
    }
}
