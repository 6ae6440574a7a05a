use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::PartitionId;

const INLINE_PARTITIONS: usize = 8;

/// Sorted, de-duplicated set of partitions.
///
/// Small fan-outs stay inline so building vertex keys on the admission path
/// does not touch the heap.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<PartitionId>", into = "Vec<PartitionId>")]
pub struct PartitionSet {
    ids: SmallVec<[PartitionId; INLINE_PARTITIONS]>,
}

impl PartitionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding one partition.
    pub fn single(partition: PartitionId) -> Self {
        let mut set = Self::new();
        set.insert(partition);
        set
    }

    /// Returns the set of every partition `0..num_partitions`.
    pub fn all(num_partitions: u32) -> Self {
        Self {
            ids: (0..num_partitions).map(PartitionId).collect(),
        }
    }

    /// Inserts a partition, returning `true` if it was not already present.
    pub fn insert(&mut self, partition: PartitionId) -> bool {
        match self.ids.binary_search(&partition) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, partition);
                true
            }
        }
    }

    /// Adds every partition of `other` to this set.
    pub fn union_with(&mut self, other: &PartitionSet) {
        for &partition in &other.ids {
            self.insert(partition);
        }
    }

    /// Returns whether the partition is a member.
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.ids.binary_search(&partition).is_ok()
    }

    /// Number of partitions in the set.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns `true` when exactly one partition is present.
    pub fn is_single(&self) -> bool {
        self.ids.len() == 1
    }

    /// Iterates partitions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.ids.iter().copied()
    }

    /// Removes every partition while keeping the allocation.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Returns the partitions as an ascending slice.
    pub fn as_slice(&self) -> &[PartitionId] {
        &self.ids
    }
}

impl Extend<PartitionId> for PartitionSet {
    fn extend<I: IntoIterator<Item = PartitionId>>(&mut self, iter: I) {
        for partition in iter {
            self.insert(partition);
        }
    }
}

impl FromIterator<PartitionId> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl From<Vec<PartitionId>> for PartitionSet {
    fn from(value: Vec<PartitionId>) -> Self {
        value.into_iter().collect()
    }
}

impl From<PartitionSet> for Vec<PartitionId> {
    fn from(value: PartitionSet) -> Self {
        value.ids.into_vec()
    }
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids.iter().map(|p| p.0)).finish()
    }
}
