//! Execution-path estimation for partitioned stored-procedure transactions.
//!
//! Each stored procedure gets a [`MarkovGraph`] over abstracted execution states.
//! Graphs are grouped per classification id in a [`GraphFamily`], which persists
//! as a single JSON artifact. The [`MarkovEstimator`] answers admission-time
//! estimates, tracks live transactions with pooled cursors, and learns from
//! finished traces on a dedicated maintenance thread.

#![warn(missing_docs)]

pub mod catalog;
pub mod estimator;
pub mod family;
pub mod graph;
pub mod profiler;
pub mod stats;
pub mod types;

pub use catalog::{ProcedureCatalog, Schema};
pub use estimator::{Estimate, EstimatorConfig, LearnerStats, MarkovEstimator, PoolStats};
pub use family::{ClassificationStrategy, GraphFamily};
pub use graph::{MarkovGraph, PathEstimate, PathOptions, StatementInvocation, VertexKey};
pub use profiler::{EstimatorProfiler, Phase, ProfileMeasurement};
pub use stats::{ProfilerStatsSource, StatsReport};
pub use types::{
    ClassificationId, MarkovError, Outcome, PartitionId, PartitionSet, ProcedureId, Result,
    StatementId, TxnId, VertexId,
};
