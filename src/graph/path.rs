use serde::Serialize;

use super::vertex::VertexKind;
use super::{MarkovGraph, Vertex};
use crate::types::{PartitionSet, VertexId};

/// Tuning for a path walk.
#[derive(Clone, Copy, Debug)]
pub struct PathOptions {
    /// Maximum number of edges followed.
    pub max_depth: usize,
    /// Edges chosen below this probability mark the estimate uncertain.
    pub min_confidence: f64,
}

/// Outcome of a greedy walk through a graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PathEstimate {
    /// Partitions touched along the chosen path, including the start vertex's.
    pub partitions: PartitionSet,
    /// Whether the path touches exactly one partition.
    pub single_partition: bool,
    /// Product of chosen edge probabilities.
    pub confidence: f64,
    /// Set when an edge fell below the threshold or the walk ended before a terminal.
    pub uncertain: bool,
    /// Whether the walk ended on COMMIT or ABORT.
    pub reached_terminal: bool,
    /// Chance of hitting ABORT at some decision vertex along the path.
    pub abort_probability: f64,
    /// Whether every query vertex on the path only reads.
    pub read_only: bool,
    /// Number of edges followed.
    pub depth: usize,
}

impl MarkovGraph {
    /// Walks from `start` along the most probable edge at each step.
    ///
    /// Ties go to the edge with more observations, then to the lower vertex id. The
    /// walk stops on a terminal vertex, after `max_depth` edges, or at a vertex with
    /// no observed successors; the latter two leave the estimate uncertain.
    pub fn estimate_path(&self, start: VertexId, opts: &PathOptions) -> PathEstimate {
        let table = self.read_table();
        let Some(mut current) = table.get(start) else {
            return PathEstimate::unknown();
        };
        let mut estimate = PathEstimate {
            partitions: current.key.partitions.clone(),
            single_partition: false,
            confidence: 1.0,
            uncertain: false,
            reached_terminal: current.key.is_terminal(),
            abort_probability: 0.0,
            read_only: current.key.kind != VertexKind::Query || current.read_only(),
            depth: 0,
        };
        let mut survive = 1.0;
        while !current.key.is_terminal() && estimate.depth < opts.max_depth {
            let Some(step) = choose_edge(current) else {
                break;
            };
            let Some(next) = table.get(step.target) else {
                break;
            };
            survive *= 1.0 - step.abort_mass;
            if step.probability < opts.min_confidence {
                estimate.uncertain = true;
            }
            estimate.confidence *= step.probability;
            estimate.partitions.union_with(&next.key.partitions);
            if next.key.kind == VertexKind::Query && !next.read_only() {
                estimate.read_only = false;
            }
            estimate.depth += 1;
            current = next;
        }
        estimate.reached_terminal = current.key.is_terminal();
        if !estimate.reached_terminal {
            estimate.uncertain = true;
        }
        if estimate.depth == 0 && !estimate.reached_terminal {
            estimate.confidence = 0.0;
        }
        estimate.abort_probability = (1.0 - survive).clamp(0.0, 1.0);
        estimate.single_partition = estimate.partitions.is_single();
        estimate
    }
}

struct Step {
    target: VertexId,
    probability: f64,
    abort_mass: f64,
}

fn choose_edge(vertex: &Vertex) -> Option<Step> {
    vertex.recompute_probabilities();
    let out = vertex.out.read();
    let mut best: Option<(VertexId, f64, u64)> = None;
    let mut abort_mass = 0.0;
    for edge in out.iter() {
        let (probability, count) = (edge.probability(), edge.count());
        if count == 0 {
            continue;
        }
        if edge.target_kind() == VertexKind::Abort {
            abort_mass += probability;
        }
        let better = match best {
            None => true,
            Some((target, p, c)) => {
                probability > p
                    || (probability == p && count > c)
                    || (probability == p && count == c && edge.target() < target)
            }
        };
        if better {
            best = Some((edge.target(), probability, count));
        }
    }
    best.map(|(target, probability, _)| Step {
        target,
        probability,
        abort_mass,
    })
}

impl PathEstimate {
    fn unknown() -> Self {
        PathEstimate {
            partitions: PartitionSet::new(),
            single_partition: false,
            confidence: 0.0,
            uncertain: true,
            reached_terminal: false,
            abort_probability: 0.0,
            read_only: false,
            depth: 0,
        }
    }
}
