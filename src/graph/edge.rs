use std::sync::atomic::{AtomicU64, Ordering};

use super::vertex::VertexKind;
use crate::types::VertexId;

/// Directed transition with traversal statistics.
///
/// Counters are atomics so the maintenance task can bump them while estimators
/// read the graph under shared locks.
#[derive(Debug)]
pub(crate) struct Edge {
    target: VertexId,
    target_kind: VertexKind,
    count: AtomicU64,
    elapsed_nanos: AtomicU64,
    probability: AtomicU64,
}

/// Point-in-time copy of an edge's statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeSnapshot {
    /// Destination vertex.
    pub target: VertexId,
    /// Role of the destination vertex.
    pub target_kind: VertexKind,
    /// Number of observed traversals.
    pub count: u64,
    /// Sum of observed elapsed time in nanoseconds.
    pub elapsed_nanos: u64,
    /// Probability derived at the last recomputation.
    pub probability: f64,
}

impl EdgeSnapshot {
    /// Mean observed elapsed time per traversal.
    pub fn mean_elapsed_nanos(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.elapsed_nanos / self.count
        }
    }
}

impl Edge {
    pub(crate) fn new(target: VertexId, target_kind: VertexKind) -> Self {
        Self {
            target,
            target_kind,
            count: AtomicU64::new(0),
            elapsed_nanos: AtomicU64::new(0),
            probability: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub(crate) fn target(&self) -> VertexId {
        self.target
    }

    pub(crate) fn target_kind(&self) -> VertexKind {
        self.target_kind
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn elapsed_nanos(&self) -> u64 {
        self.elapsed_nanos.load(Ordering::Relaxed)
    }

    pub(crate) fn probability(&self) -> f64 {
        f64::from_bits(self.probability.load(Ordering::Relaxed))
    }

    pub(crate) fn set_probability(&self, probability: f64) {
        self.probability
            .store(probability.to_bits(), Ordering::Relaxed);
    }

    /// Adds one traversal. Returns `false` when the counter would overflow.
    pub(crate) fn record(&self, elapsed_nanos: u64) -> bool {
        let bumped = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1))
            .is_ok();
        if bumped {
            let _ = self
                .elapsed_nanos
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                    Some(t.saturating_add(elapsed_nanos))
                });
        }
        bumped
    }

    pub(crate) fn restore(&self, count: u64, elapsed_nanos: u64) {
        self.count.store(count, Ordering::Release);
        self.elapsed_nanos.store(elapsed_nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EdgeSnapshot {
        EdgeSnapshot {
            target: self.target,
            target_kind: self.target_kind,
            count: self.count(),
            elapsed_nanos: self.elapsed_nanos(),
            probability: self.probability(),
        }
    }
}
