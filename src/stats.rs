//! Tabular view of estimator measurements for an external stats collector.

use std::sync::Arc;

use serde::Serialize;

use crate::estimator::{LearnerStats, MarkovEstimator, PoolStats};
use crate::profiler::ProfilerSnapshot;
use crate::types::PartitionId;

/// Leading column of every row.
pub const PARTITION_COLUMN: &str = "PARTITION";

/// Everything the stats collector polls in one serializable value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsReport {
    /// Phase measurements and lookup counters.
    pub profiler: ProfilerSnapshot,
    /// Cursor pool counters.
    pub pool: PoolStats,
    /// Learning queue counters.
    pub learner: LearnerStats,
    /// Transactions with an open cursor.
    pub in_flight: usize,
    /// Graphs held by the family.
    pub graphs: usize,
}

/// Exposes an estimator's profile measurements as rows of named columns.
///
/// Each measurement contributes two columns: its upper-cased name holding total
/// nanoseconds, and `<NAME>_CNT` holding the invocation count.
#[derive(Debug, Clone)]
pub struct ProfilerStatsSource {
    estimator: Arc<MarkovEstimator>,
}

impl ProfilerStatsSource {
    /// Wraps an estimator.
    pub fn new(estimator: Arc<MarkovEstimator>) -> Self {
        Self { estimator }
    }

    /// Column names in row order.
    pub fn columns(&self) -> Vec<String> {
        let measurements = self.estimator.profiler().measurements();
        let mut columns = Vec::with_capacity(1 + measurements.len() * 2);
        columns.push(PARTITION_COLUMN.to_string());
        for m in measurements {
            let name = m.name().to_ascii_uppercase();
            columns.push(name.clone());
            columns.push(format!("{name}_CNT"));
        }
        columns
    }

    /// Values for the row reported under `partition`, aligned with [`Self::columns`].
    pub fn row(&self, partition: PartitionId) -> Vec<u64> {
        let measurements = self.estimator.profiler().measurements();
        let mut row = Vec::with_capacity(1 + measurements.len() * 2);
        row.push(u64::from(partition.0));
        for m in measurements {
            row.push(m.total_nanos());
            row.push(m.invocations());
        }
        row
    }

    /// Full report including pool and learner counters.
    pub fn report(&self) -> StatsReport {
        StatsReport {
            profiler: self.estimator.profiler().snapshot(),
            pool: self.estimator.pool_stats(),
            learner: self.estimator.learner_stats(),
            in_flight: self.estimator.in_flight(),
            graphs: self.estimator.family().graph_count(),
        }
    }

    /// Zeroes the estimator's measurements; the collector decides when.
    pub fn reset(&self) {
        self.estimator.profiler().reset();
    }
}
