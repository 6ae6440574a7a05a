#![forbid(unsafe_code)]

//! Per-procedure probabilistic model of abstracted execution states.
//!
//! A [`MarkovGraph`] owns the vertices and edges observed for one stored procedure.
//! Estimators read it concurrently under shared locks; every mutation is applied by
//! the single maintenance task that drains the learning queue, so count increments
//! never run on a transaction's execution thread.

mod edge;
mod path;
mod ser;
mod vertex;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::types::{MarkovError, ProcedureId, Result, VertexId};

pub use edge::EdgeSnapshot;
pub use path::{PathEstimate, PathOptions};
pub use ser::{EdgeDocument, GraphDocument, VertexDocument};
pub use vertex::{StatementInvocation, VertexKey, VertexKind};

use edge::Edge;
pub(crate) use vertex::Vertex;

/// Vertex id of START in every graph.
pub const START_VERTEX: VertexId = VertexId(0);
/// Vertex id of COMMIT in every graph.
pub const COMMIT_VERTEX: VertexId = VertexId(1);
/// Vertex id of ABORT in every graph.
pub const ABORT_VERTEX: VertexId = VertexId(2);

/// A transition observed by a transaction, queued for the maintenance task.
#[derive(Clone, Debug)]
pub struct ObservedTransition {
    /// Source state.
    pub from: VertexKey,
    /// Destination state.
    pub to: VertexKey,
    /// Whether the invocation reaching `to` only read data.
    pub to_read_only: bool,
    /// Time spent between the two states.
    pub elapsed: Duration,
}

impl ObservedTransition {
    /// Creates a transition into a read-only destination.
    pub fn new(from: VertexKey, to: VertexKey, elapsed: Duration) -> Self {
        Self {
            from,
            to,
            to_read_only: true,
            elapsed,
        }
    }
}

#[derive(Default)]
pub(crate) struct VertexTable {
    vertices: Vec<Arc<Vertex>>,
    index: FxHashMap<VertexKey, VertexId>,
}

impl VertexTable {
    pub(crate) fn get(&self, id: VertexId) -> Option<&Arc<Vertex>> {
        self.vertices.get(id.index())
    }

    fn lookup(&self, key: &VertexKey) -> Option<VertexId> {
        self.index.get(key).copied()
    }

    fn push(&mut self, key: VertexKey, read_only: bool) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices
            .push(Arc::new(Vertex::new(id, key.clone(), read_only)));
        self.index.insert(key, id);
        id
    }
}

/// Directed weighted graph of execution states for one procedure.
pub struct MarkovGraph {
    procedure: ProcedureId,
    table: RwLock<VertexTable>,
    transitions: AtomicU64,
    quarantined: AtomicBool,
}

impl std::fmt::Debug for MarkovGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkovGraph")
            .field("procedure", &self.procedure)
            .field("vertices", &self.vertex_count())
            .field("transitions", &self.transitions())
            .field("quarantined", &self.is_quarantined())
            .finish()
    }
}

impl MarkovGraph {
    /// Creates a graph holding only START, COMMIT and ABORT.
    pub fn new(procedure: ProcedureId) -> Self {
        let mut table = VertexTable::default();
        table.push(VertexKey::start(), true);
        table.push(VertexKey::commit(), true);
        table.push(VertexKey::abort(), true);
        Self::with_table(procedure, table)
    }

    fn with_table(procedure: ProcedureId, table: VertexTable) -> Self {
        Self {
            procedure,
            table: RwLock::new(table),
            transitions: AtomicU64::new(0),
            quarantined: AtomicBool::new(false),
        }
    }

    /// Procedure this graph models.
    pub fn procedure(&self) -> ProcedureId {
        self.procedure
    }

    /// Number of vertices, including the three special ones.
    pub fn vertex_count(&self) -> usize {
        self.table.read().vertices.len()
    }

    /// Number of edges across all vertices.
    pub fn edge_total(&self) -> usize {
        let table = self.table.read();
        table.vertices.iter().map(|v| v.out.read().len()).sum()
    }

    /// Number of transitions applied since the graph was created or loaded.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Returns `true` when the graph has no observed transitions at all.
    pub fn is_untrained(&self) -> bool {
        let table = self.table.read();
        table.vertices.iter().all(|v| v.out.read().is_empty())
    }

    /// Looks up a vertex by structural identity.
    pub fn vertex_id(&self, key: &VertexKey) -> Option<VertexId> {
        self.table.read().lookup(key)
    }

    /// Returns a copy of the key for a vertex id.
    pub fn vertex_key(&self, id: VertexId) -> Option<VertexKey> {
        self.table.read().get(id).map(|v| v.key.clone())
    }

    /// Returns whether a vertex is read-only so far.
    pub fn vertex_read_only(&self, id: VertexId) -> Option<bool> {
        self.table.read().get(id).map(|v| v.read_only())
    }

    /// Looks up or inserts a vertex by value equality.
    pub fn get_or_create_vertex(&self, key: &VertexKey) -> Result<VertexId> {
        key.validate()
            .map_err(|reason| MarkovError::Malformed(reason.to_string()))?;
        if let Some(id) = self.vertex_id(key) {
            return Ok(id);
        }
        let mut table = self.table.write();
        if let Some(id) = table.lookup(key) {
            return Ok(id);
        }
        let id = table.push(key.clone(), true);
        trace!(procedure = %self.procedure, vertex = %id, "graph.vertex.create");
        Ok(id)
    }

    /// Applies one observed transition, creating the destination vertex and the edge
    /// as needed.
    ///
    /// Intended for the maintenance task. A transition that violates the graph's
    /// structure quarantines the graph. A transition leaving a vertex no transaction
    /// has reached yet (its inbound update was dropped) is skipped and `Ok(false)` is
    /// returned, so every vertex with edges stays reachable from START.
    pub fn add_observed_transition(&self, transition: &ObservedTransition) -> Result<bool> {
        if self.is_quarantined() {
            return Err(MarkovError::Quarantined(self.procedure));
        }
        if let Err(reason) = Self::check_transition(transition) {
            self.quarantine(reason);
            return Err(MarkovError::Malformed(reason.to_string()));
        }
        let Some(from) = self.reached_vertex(&transition.from) else {
            trace!(procedure = %self.procedure, "graph.transition.detached");
            return Ok(false);
        };
        let to = self.get_or_create_vertex(&transition.to)?;
        let elapsed_nanos = transition.elapsed.as_nanos().min(u64::MAX as u128) as u64;

        let table = self.table.read();
        let (Some(source), Some(target)) = (table.get(from), table.get(to)) else {
            self.quarantine("vertex id out of range");
            return Err(MarkovError::Quarantined(self.procedure));
        };
        let edge = Self::edge_or_insert(source, target);
        if !edge.record(elapsed_nanos) {
            self.quarantine("edge counter overflow");
            return Err(MarkovError::Quarantined(self.procedure));
        }
        if !transition.to_read_only {
            target.mark_read_write();
        }
        if from == START_VERTEX {
            source.add_hit();
        }
        target.add_hit();
        source.mark_dirty();
        self.transitions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn reached_vertex(&self, key: &VertexKey) -> Option<VertexId> {
        let table = self.table.read();
        let id = table.lookup(key)?;
        let reached = id == START_VERTEX || table.get(id).is_some_and(|v| v.hits() > 0);
        reached.then_some(id)
    }

    fn check_transition(transition: &ObservedTransition) -> std::result::Result<(), &'static str> {
        transition.from.validate()?;
        transition.to.validate()?;
        if transition.from.is_terminal() {
            return Err("transition out of a terminal vertex");
        }
        if transition.to.kind == VertexKind::Start {
            return Err("transition into START");
        }
        Ok(())
    }

    fn edge_or_insert(source: &Vertex, target: &Vertex) -> Arc<Edge> {
        if let Some(edge) = source
            .out
            .read()
            .iter()
            .find(|edge| edge.target() == target.id)
        {
            return Arc::clone(edge);
        }
        let mut out = source.out.write();
        if let Some(edge) = out.iter().find(|edge| edge.target() == target.id) {
            return Arc::clone(edge);
        }
        let edge = Arc::new(Edge::new(target.id, target.key.kind));
        out.push(Arc::clone(&edge));
        edge
    }

    /// Recomputes outgoing probabilities of a vertex if new counts arrived.
    ///
    /// Returns `true` when probabilities were rewritten. Calling it again without
    /// intervening updates is a no-op.
    pub fn recompute_probabilities(&self, vertex: VertexId) -> bool {
        let table = self.table.read();
        table
            .get(vertex)
            .map(|v| v.recompute_probabilities())
            .unwrap_or(false)
    }

    /// Recomputes every dirty vertex, returning how many were rewritten.
    pub fn recompute_dirty(&self) -> usize {
        let table = self.table.read();
        table
            .vertices
            .iter()
            .filter(|v| v.is_dirty() && v.recompute_probabilities())
            .count()
    }

    /// Snapshot of a vertex's outgoing edges with up-to-date probabilities.
    pub fn outgoing(&self, vertex: VertexId) -> Vec<EdgeSnapshot> {
        let table = self.table.read();
        let Some(v) = table.get(vertex) else {
            return Vec::new();
        };
        v.recompute_probabilities();
        let out = v.out.read();
        out.iter().map(|edge| edge.snapshot()).collect()
    }

    /// Returns the statistics of the edge `from -> to`, if observed.
    pub fn edge(&self, from: VertexId, to: VertexId) -> Option<EdgeSnapshot> {
        self.outgoing(from).into_iter().find(|e| e.target == to)
    }

    /// Observed traversal count of `from -> to`; zero when the edge is absent.
    pub fn edge_count(&self, from: VertexId, to: VertexId) -> u64 {
        let table = self.table.read();
        table
            .get(from)
            .and_then(|v| {
                v.out
                    .read()
                    .iter()
                    .find(|e| e.target() == to)
                    .map(|e| e.count())
            })
            .unwrap_or(0)
    }

    /// Takes the graph out of service; estimates fall back to the pessimistic default.
    pub fn quarantine(&self, reason: &str) {
        if !self.quarantined.swap(true, Ordering::AcqRel) {
            warn!(procedure = %self.procedure, reason, "graph.quarantine");
        }
    }

    /// Returns whether the graph has been quarantined.
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    pub(crate) fn read_table(&self) -> RwLockReadGuard<'_, VertexTable> {
        self.table.read()
    }
}
