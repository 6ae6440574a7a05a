use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::edge::Edge;
use crate::types::{Outcome, PartitionId, PartitionSet, StatementId, VertexId};

/// Role of a vertex in the execution-state graph.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VertexKind {
    /// Entry state of every transaction.
    Start,
    /// A pending statement invocation.
    Query,
    /// Terminal commit state.
    Commit,
    /// Terminal abort state.
    Abort,
}

impl VertexKind {
    /// Returns `true` for commit and abort.
    pub fn is_terminal(self) -> bool {
        matches!(self, VertexKind::Commit | VertexKind::Abort)
    }
}

/// Structural identity of an abstracted execution state.
///
/// Two invocations land on the same vertex iff statement, partitions touched so far
/// and round index all match.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VertexKey {
    /// Role of the vertex.
    pub kind: VertexKind,
    /// Pending statement, present only for query vertices.
    pub statement: Option<StatementId>,
    /// Partitions touched so far, including the pending statement's.
    pub partitions: PartitionSet,
    /// How many earlier invocations of the same statement the transaction made.
    pub round: u32,
}

impl VertexKey {
    /// The START vertex key.
    pub fn start() -> Self {
        Self::special(VertexKind::Start)
    }

    /// The COMMIT vertex key.
    pub fn commit() -> Self {
        Self::special(VertexKind::Commit)
    }

    /// The ABORT vertex key.
    pub fn abort() -> Self {
        Self::special(VertexKind::Abort)
    }

    /// Terminal key matching a transaction outcome.
    pub fn terminal(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Commit => Self::commit(),
            Outcome::Abort => Self::abort(),
        }
    }

    /// Key for a query vertex.
    pub fn query(statement: StatementId, partitions: PartitionSet, round: u32) -> Self {
        Self {
            kind: VertexKind::Query,
            statement: Some(statement),
            partitions,
            round,
        }
    }

    fn special(kind: VertexKind) -> Self {
        Self {
            kind,
            statement: None,
            partitions: PartitionSet::new(),
            round: 0,
        }
    }

    /// Returns `true` for commit and abort keys.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Checks that the key is well-formed for its kind.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        match self.kind {
            VertexKind::Query if self.statement.is_none() => Err("query vertex without statement"),
            VertexKind::Query => Ok(()),
            _ if self.statement.is_some() => Err("non-query vertex carries a statement"),
            _ if !self.partitions.is_empty() || self.round != 0 => {
                Err("special vertex carries partitions or round")
            }
            _ => Ok(()),
        }
    }
}

/// One statement invocation observed while a transaction runs.
#[derive(Clone, Debug)]
pub struct StatementInvocation {
    /// Statement being invoked.
    pub statement: StatementId,
    /// Partitions the invocation touches.
    pub partitions: PartitionSet,
    /// Whether the statement only reads.
    pub read_only: bool,
}

impl StatementInvocation {
    /// Creates an invocation touching the given partitions.
    pub fn new(
        statement: StatementId,
        partitions: impl IntoIterator<Item = PartitionId>,
        read_only: bool,
    ) -> Self {
        Self {
            statement,
            partitions: partitions.into_iter().collect(),
            read_only,
        }
    }
}

pub(crate) struct Vertex {
    pub(crate) id: VertexId,
    pub(crate) key: VertexKey,
    read_only: AtomicBool,
    hits: AtomicU64,
    dirty: AtomicBool,
    pub(crate) out: RwLock<Vec<Arc<Edge>>>,
}

impl Vertex {
    pub(crate) fn new(id: VertexId, key: VertexKey, read_only: bool) -> Self {
        Self {
            id,
            key,
            read_only: AtomicBool::new(read_only),
            hits: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            out: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_read_write(&self) {
        self.read_only.store(false, Ordering::Relaxed);
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn add_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_hits(&self, hits: u64) {
        self.hits.store(hits, Ordering::Relaxed);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Derives outgoing probabilities from counts if the vertex is dirty.
    ///
    /// Counts are read once into a local buffer so the stored probabilities always
    /// sum to one for the counts they were derived from.
    pub(crate) fn recompute_probabilities(&self) -> bool {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        let out = self.out.read();
        let counts: smallvec::SmallVec<[u64; 8]> = out.iter().map(|edge| edge.count()).collect();
        let total: u128 = counts.iter().map(|&c| u128::from(c)).sum();
        for (edge, count) in out.iter().zip(counts) {
            let probability = if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            };
            edge.set_probability(probability);
        }
        true
    }
}
