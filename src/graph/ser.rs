use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::edge::Edge;
use super::vertex::{VertexKey, VertexKind};
use super::{MarkovGraph, VertexTable, ABORT_VERTEX, COMMIT_VERTEX, START_VERTEX};
use crate::catalog::ProcedureCatalog;
use crate::types::{MarkovError, PartitionSet, ProcedureId, Result, VertexId};

/// Persisted form of one graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Vertices in id order.
    pub vertices: Vec<VertexDocument>,
    /// Edges grouped by source vertex, in insertion order.
    pub edges: Vec<EdgeDocument>,
    /// Whether the graph was quarantined when saved.
    #[serde(default)]
    pub quarantined: bool,
}

/// Persisted form of one vertex.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexDocument {
    /// Vertex id referenced by edges.
    pub id: u32,
    /// Vertex role.
    pub kind: VertexKind,
    /// Statement catalog key, present only for query vertices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    /// Partitions touched so far.
    #[serde(default)]
    pub partitions: PartitionSet,
    /// Round index of the statement.
    #[serde(default)]
    pub round: u32,
    /// Whether every invocation seen at this vertex was read-only.
    pub read_only: bool,
    /// Number of times transactions reached the vertex.
    pub hits: u64,
}

/// Persisted form of one edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeDocument {
    /// Source vertex id.
    pub from: u32,
    /// Destination vertex id.
    pub to: u32,
    /// Observed traversal count.
    pub count: u64,
    /// Sum of observed elapsed nanoseconds.
    pub elapsed_nanos: u64,
}

impl MarkovGraph {
    /// Captures the graph as a document, naming statements through the catalog.
    pub fn to_document(&self, catalog: &dyn ProcedureCatalog) -> Result<GraphDocument> {
        let table = self.read_table();
        let mut vertices = Vec::with_capacity(table.vertices.len());
        let mut edges = Vec::new();
        for vertex in &table.vertices {
            let statement = match vertex.key.statement {
                Some(stmt) => Some(
                    catalog
                        .statement_key(self.procedure, stmt)
                        .ok_or_else(|| {
                            MarkovError::unresolved("statement", format!("{}#{}", self.procedure, stmt.0))
                        })?
                        .to_string(),
                ),
                None => None,
            };
            vertices.push(VertexDocument {
                id: vertex.id.0,
                kind: vertex.key.kind,
                statement,
                partitions: vertex.key.partitions.clone(),
                round: vertex.key.round,
                read_only: vertex.read_only(),
                hits: vertex.hits(),
            });
            for edge in vertex.out.read().iter() {
                edges.push(EdgeDocument {
                    from: vertex.id.0,
                    to: edge.target().0,
                    count: edge.count(),
                    elapsed_nanos: edge.elapsed_nanos(),
                });
            }
        }
        Ok(GraphDocument {
            vertices,
            edges,
            quarantined: self.is_quarantined(),
        })
    }

    /// Rebuilds a graph from a document, resolving statement keys through the catalog.
    ///
    /// Vertex ids are reassigned densely in document order. Any dangling reference,
    /// duplicate identity or missing special vertex fails the whole load.
    pub fn from_document(
        procedure: ProcedureId,
        doc: &GraphDocument,
        catalog: &dyn ProcedureCatalog,
    ) -> Result<Self> {
        let mut table = VertexTable::default();
        let mut remap: HashMap<u32, VertexId> = HashMap::with_capacity(doc.vertices.len());
        for vdoc in &doc.vertices {
            let statement = match &vdoc.statement {
                Some(key) => Some(
                    catalog
                        .resolve_statement(procedure, key)
                        .ok_or_else(|| MarkovError::unresolved("statement", key.clone()))?,
                ),
                None => None,
            };
            let key = VertexKey {
                kind: vdoc.kind,
                statement,
                partitions: vdoc.partitions.clone(),
                round: vdoc.round,
            };
            key.validate().map_err(|reason| {
                MarkovError::Malformed(format!("vertex {}: {reason}", vdoc.id))
            })?;
            if table.lookup(&key).is_some() {
                return Err(MarkovError::Malformed(format!(
                    "vertex {} duplicates an earlier identity",
                    vdoc.id
                )));
            }
            let id = table.push(key, vdoc.read_only);
            if remap.insert(vdoc.id, id).is_some() {
                return Err(MarkovError::Malformed(format!(
                    "duplicate vertex id {}",
                    vdoc.id
                )));
            }
            if let Some(vertex) = table.get(id) {
                vertex.set_hits(vdoc.hits);
            }
        }
        for (key, expected) in [
            (VertexKey::start(), START_VERTEX),
            (VertexKey::commit(), COMMIT_VERTEX),
            (VertexKey::abort(), ABORT_VERTEX),
        ] {
            if table.lookup(&key) != Some(expected) {
                return Err(MarkovError::Malformed(format!(
                    "{:?} vertex missing or out of place",
                    key.kind
                )));
            }
        }
        for edoc in &doc.edges {
            let resolve = |id: u32| {
                remap.get(&id).copied().ok_or_else(|| {
                    MarkovError::Malformed(format!("edge references unknown vertex {id}"))
                })
            };
            let (from, to) = (resolve(edoc.from)?, resolve(edoc.to)?);
            let (Some(source), Some(target)) = (table.get(from), table.get(to)) else {
                return Err(MarkovError::Malformed("edge endpoint out of range".into()));
            };
            if source.key.is_terminal() || target.key.kind == VertexKind::Start {
                return Err(MarkovError::Malformed(format!(
                    "edge {} -> {} leaves a terminal or enters START",
                    edoc.from, edoc.to
                )));
            }
            let mut out = source.out.write();
            if out.iter().any(|edge| edge.target() == to) {
                return Err(MarkovError::Malformed(format!(
                    "duplicate edge {} -> {}",
                    edoc.from, edoc.to
                )));
            }
            let edge = Edge::new(to, target.key.kind);
            edge.restore(edoc.count, edoc.elapsed_nanos);
            out.push(Arc::new(edge));
            drop(out);
            source.mark_dirty();
        }
        check_reachable(&table)?;
        let graph = MarkovGraph::with_table(procedure, table);
        graph.recompute_dirty();
        if doc.quarantined {
            graph.quarantine("quarantined in persisted artifact");
        }
        Ok(graph)
    }
}

/// Every non-terminal vertex that carries edges or hits must be reachable from START.
fn check_reachable(table: &VertexTable) -> Result<()> {
    let mut seen = vec![false; table.vertices.len()];
    let mut stack = vec![START_VERTEX];
    seen[START_VERTEX.index()] = true;
    while let Some(id) = stack.pop() {
        let Some(vertex) = table.get(id) else {
            continue;
        };
        for edge in vertex.out.read().iter() {
            let target = edge.target();
            if !seen[target.index()] {
                seen[target.index()] = true;
                stack.push(target);
            }
        }
    }
    for (vertex, reached) in table.vertices.iter().zip(seen) {
        if reached || vertex.key.is_terminal() {
            continue;
        }
        if vertex.hits() > 0 || !vertex.out.read().is_empty() {
            return Err(MarkovError::Malformed(format!(
                "vertex {} unreachable from START",
                vertex.id
            )));
        }
    }
    Ok(())
}
