use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;

use super::Estimate;
use crate::graph::{MarkovGraph, ObservedTransition, StatementInvocation, VertexKey};
use crate::types::{Outcome, PartitionId, PartitionSet, StatementId, TxnId};

/// Live position of one transaction inside its graph.
///
/// Owned by exactly one in-flight transaction; never shared.
#[derive(Debug)]
pub struct EstimationState {
    pub(crate) txn_id: TxnId,
    pub(crate) base_partition: PartitionId,
    pub(crate) graph: Option<Arc<MarkovGraph>>,
    current: VertexKey,
    touched: PartitionSet,
    rounds: SmallVec<[(StatementId, u32); 8]>,
    trace: Vec<ObservedTransition>,
    wrote: bool,
    pub(crate) estimate: Estimate,
}

impl EstimationState {
    fn new() -> Self {
        Self {
            txn_id: TxnId(0),
            base_partition: PartitionId(0),
            graph: None,
            current: VertexKey::start(),
            touched: PartitionSet::new(),
            rounds: SmallVec::new(),
            trace: Vec::new(),
            wrote: false,
            estimate: Estimate::default(),
        }
    }

    pub(crate) fn init(
        &mut self,
        txn_id: TxnId,
        base_partition: PartitionId,
        graph: Option<Arc<MarkovGraph>>,
    ) {
        self.txn_id = txn_id;
        self.base_partition = base_partition;
        self.graph = graph;
    }

    fn reset(&mut self) {
        self.graph = None;
        self.current = VertexKey::start();
        self.touched.clear();
        self.rounds.clear();
        self.trace.clear();
        self.wrote = false;
        self.estimate = Estimate::default();
    }

    /// Transaction owning the cursor.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Vertex the transaction currently sits on.
    pub fn current(&self) -> &VertexKey {
        &self.current
    }

    /// Partitions touched by consumed invocations.
    pub fn touched(&self) -> &PartitionSet {
        &self.touched
    }

    /// Whether any consumed invocation was read-write. Sticky until release.
    pub fn wrote(&self) -> bool {
        self.wrote
    }

    /// Transitions recorded since admission.
    pub fn trace(&self) -> &[ObservedTransition] {
        &self.trace
    }

    /// Moves to the vertex reached by `invocation` and returns the transition taken.
    ///
    /// The round index counts earlier invocations of the same statement.
    pub(crate) fn advance(
        &mut self,
        invocation: &StatementInvocation,
        elapsed: Duration,
        record: bool,
    ) -> ObservedTransition {
        let round = match self
            .rounds
            .iter_mut()
            .find(|(stmt, _)| *stmt == invocation.statement)
        {
            Some((_, seen)) => {
                *seen += 1;
                *seen
            }
            None => {
                self.rounds.push((invocation.statement, 0));
                0
            }
        };
        self.touched.union_with(&invocation.partitions);
        self.wrote |= !invocation.read_only;
        let next = VertexKey::query(invocation.statement, self.touched.clone(), round);
        let from = std::mem::replace(&mut self.current, next.clone());
        let transition = ObservedTransition {
            from,
            to: next,
            to_read_only: invocation.read_only,
            elapsed,
        };
        if record {
            self.trace.push(transition.clone());
        }
        transition
    }

    /// Records the terminal transition and hands back the full trace.
    ///
    /// The cursor keeps a buffer of the same capacity for its next transaction.
    pub(crate) fn finish(&mut self, outcome: Outcome, elapsed: Duration) -> Vec<ObservedTransition> {
        let terminal = VertexKey::terminal(outcome);
        let from = std::mem::replace(&mut self.current, terminal.clone());
        self.trace
            .push(ObservedTransition::new(from, terminal, elapsed));
        let capacity = self.trace.len();
        std::mem::replace(&mut self.trace, Vec::with_capacity(capacity))
    }
}

/// Counters describing cursor pool behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Cursors allocated, pooled or not.
    pub created: u64,
    /// Acquisitions satisfied from a free list.
    pub reused: u64,
    /// Acquisitions that found their partition's free list empty.
    pub exhausted: u64,
    /// Cursors handed back.
    pub released: u64,
    /// Released cursors dropped because their free list was full.
    pub discarded: u64,
    /// Cursors currently idle across all free lists.
    pub idle: u64,
}

/// Per-partition bounded free lists of cursors.
pub struct CursorPool {
    lists: Vec<Mutex<Vec<Box<EstimationState>>>>,
    capacity: usize,
    created: AtomicU64,
    reused: AtomicU64,
    exhausted: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

impl CursorPool {
    /// Creates `partitions` free lists, each pre-filled with `capacity` cursors.
    pub fn new(partitions: u32, capacity: usize) -> Self {
        let lists = (0..partitions.max(1))
            .map(|_| {
                Mutex::new(
                    (0..capacity)
                        .map(|_| Box::new(EstimationState::new()))
                        .collect(),
                )
            })
            .collect();
        let created = u64::from(partitions.max(1)) * capacity as u64;
        Self {
            lists,
            capacity,
            created: AtomicU64::new(created),
            reused: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    fn list(&self, partition: PartitionId) -> &Mutex<Vec<Box<EstimationState>>> {
        &self.lists[partition.0 as usize % self.lists.len()]
    }

    /// Takes a cursor for a transaction homed at `partition`. Never blocks on an
    /// empty list; allocates instead.
    pub fn acquire(&self, partition: PartitionId) -> Box<EstimationState> {
        if let Some(state) = self.list(partition).lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return state;
        }
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        Box::new(EstimationState::new())
    }

    /// Resets a cursor and returns it to its home partition's list.
    pub fn release(&self, mut state: Box<EstimationState>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        state.reset();
        let mut list = self.list(state.base_partition).lock();
        if list.len() < self.capacity {
            list.push(state);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: self.lists.iter().map(|l| l.lock().len() as u64).sum(),
        }
    }
}

impl std::fmt::Debug for CursorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorPool")
            .field("partitions", &self.lists.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
