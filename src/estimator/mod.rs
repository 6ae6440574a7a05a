#![forbid(unsafe_code)]

//! Runtime estimator used by the transaction coordinator.
//!
//! [`MarkovEstimator::estimate`] selects a graph and walks it at admission,
//! [`MarkovEstimator::consume`] advances the transaction's cursor as statements run,
//! and [`MarkovEstimator::finalize`] hands the finished trace to the maintenance
//! thread. No lock is held between these calls; a cursor lives in a sharded table
//! keyed by transaction id and is taken out of it while being advanced.

mod config;
mod cursor;
mod learner;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::family::GraphFamily;
use crate::graph::{MarkovGraph, PathEstimate, PathOptions, StatementInvocation, START_VERTEX};
use crate::profiler::{EstimatorProfiler, Phase};
use crate::types::{MarkovError, Outcome, PartitionId, PartitionSet, ProcedureId, Result, TxnId};

pub use config::EstimatorConfig;
pub use cursor::{CursorPool, EstimationState, PoolStats};
pub use learner::LearnerStats;

use learner::{Learner, LearningMessage};

/// Predicted execution footprint of a transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Estimate {
    /// Partitions the transaction is expected to touch.
    pub partitions: PartitionSet,
    /// Whether exactly one partition is expected.
    pub single_partition: bool,
    /// Probability of the predicted path.
    pub confidence: f64,
    /// Set when the prediction should not be trusted for fast paths.
    pub uncertain: bool,
    /// Chance the transaction aborts along the predicted path.
    pub abort_probability: f64,
    /// Whether the predicted path only reads.
    pub read_only: bool,
}

impl Estimate {
    /// Conservative default: every partition, no confidence.
    pub fn pessimistic(num_partitions: u32) -> Self {
        let partitions = PartitionSet::all(num_partitions);
        Self {
            single_partition: partitions.is_single(),
            partitions,
            confidence: 0.0,
            uncertain: true,
            abort_probability: 1.0,
            read_only: false,
        }
    }

    fn from_path(path: PathEstimate, touched: &PartitionSet) -> Self {
        let mut partitions = path.partitions;
        partitions.union_with(touched);
        Self {
            single_partition: partitions.is_single(),
            partitions,
            confidence: path.confidence,
            uncertain: path.uncertain,
            abort_probability: path.abort_probability,
            read_only: path.read_only,
        }
    }

    fn with_touched(mut self, touched: &PartitionSet) -> Self {
        self.partitions.union_with(touched);
        self.single_partition = self.partitions.is_single();
        self
    }
}

type Shard = Mutex<FxHashMap<TxnId, Box<EstimationState>>>;

/// Admission-time and live execution-path estimator over a [`GraphFamily`].
pub struct MarkovEstimator {
    family: Arc<GraphFamily>,
    config: EstimatorConfig,
    options: PathOptions,
    pool: CursorPool,
    shards: Box<[Shard]>,
    learner: Learner,
    profiler: EstimatorProfiler,
}

impl std::fmt::Debug for MarkovEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkovEstimator")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .field("pool", &self.pool_stats())
            .field("learner", &self.learner_stats())
            .finish()
    }
}

impl MarkovEstimator {
    /// Creates an estimator over `family` and spawns its maintenance thread.
    pub fn new(family: Arc<GraphFamily>, config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        let config = config.normalize();
        let learner = Learner::spawn(config.queue_capacity, config.learner_batch)?;
        let shards = (0..config.in_flight_shards)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        debug!(
            partitions = config.num_partitions,
            pool = config.cursor_pool_size,
            shards = config.in_flight_shards,
            "estimator.open"
        );
        Ok(Self {
            family,
            options: config.path_options(),
            pool: CursorPool::new(config.num_partitions, config.cursor_pool_size),
            shards,
            learner,
            profiler: EstimatorProfiler::new(config.profiling),
            config,
        })
    }

    /// Family of graphs consulted by this estimator.
    pub fn family(&self) -> &Arc<GraphFamily> {
        &self.family
    }

    /// Effective configuration.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    fn shard(&self, txn_id: TxnId) -> &Shard {
        &self.shards[(txn_id.0 % self.shards.len() as u64) as usize]
    }

    fn pessimistic(&self) -> Estimate {
        self.profiler.fallback();
        Estimate::pessimistic(self.config.num_partitions)
    }

    fn select_graph(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        params: &[String],
        procedure: ProcedureId,
    ) -> Option<Arc<MarkovGraph>> {
        let id = match self.family.classify(txn_id, base_partition, params, procedure) {
            Ok(id) => id,
            Err(err) => {
                debug!(txn = %txn_id, procedure = %procedure, error = %err, "estimator.classify.failed");
                self.profiler.cache_lookup(false);
                return None;
            }
        };
        match self.family.get(id, procedure) {
            Some(graph) => {
                self.profiler.cache_lookup(true);
                Some(graph)
            }
            None => {
                self.profiler.cache_lookup(false);
                Some(self.family.get_or_create(id, procedure))
            }
        }
    }

    /// Estimates the footprint of an admitted transaction and opens its cursor.
    ///
    /// Unknown pairs, quarantined graphs and unsupported classifications all answer
    /// with [`Estimate::pessimistic`].
    pub fn estimate(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        params: &[String],
        procedure: ProcedureId,
    ) -> Estimate {
        let start = self.profiler.timer();
        let graph = self.select_graph(txn_id, base_partition, params, procedure);
        self.profiler.record(Phase::Cache, start);

        let start = self.profiler.timer();
        let estimate = match graph.as_deref() {
            Some(graph) if !graph.is_quarantined() => {
                let path = graph.estimate_path(START_VERTEX, &self.options);
                if path.depth == 0 && !path.reached_terminal {
                    debug!(txn = %txn_id, procedure = %procedure, "estimator.fallback.untrained");
                    self.pessimistic()
                } else {
                    Estimate::from_path(path, &PartitionSet::new())
                }
            }
            Some(_) => {
                debug!(txn = %txn_id, procedure = %procedure, "estimator.fallback.quarantined");
                self.pessimistic()
            }
            None => self.pessimistic(),
        };
        self.profiler.record(Phase::Compute, start);

        let mut cursor = self.pool.acquire(base_partition);
        cursor.init(txn_id, base_partition, graph);
        cursor.estimate = estimate.clone();
        if let Some(previous) = self.shard(txn_id).lock().insert(txn_id, cursor) {
            debug!(txn = %txn_id, "estimator.cursor.replaced");
            self.pool.release(previous);
        }
        trace!(
            txn = %txn_id,
            partitions = estimate.partitions.len(),
            confidence = estimate.confidence,
            uncertain = estimate.uncertain,
            "estimator.estimate"
        );
        estimate
    }

    /// Advances the transaction's cursor past one statement invocation and returns
    /// the refined estimate. Partitions already touched are always included, and a
    /// transaction that has written is never reported read-only.
    pub fn consume(
        &self,
        txn_id: TxnId,
        invocation: &StatementInvocation,
        elapsed: Duration,
    ) -> Result<Estimate> {
        let mut cursor = self
            .shard(txn_id)
            .lock()
            .remove(&txn_id)
            .ok_or(MarkovError::UnknownTransaction(txn_id))?;
        let start = self.profiler.timer();
        let learn_now = self.config.learning && self.config.learn_on_consume;
        let transition = cursor.advance(invocation, elapsed, !self.config.learn_on_consume);

        let mut estimate = match cursor.graph.clone() {
            Some(graph) if !graph.is_quarantined() => {
                if learn_now {
                    let queued = self.profiler.timer();
                    self.learner.enqueue(LearningMessage::Transition {
                        graph: Arc::clone(&graph),
                        transition,
                    });
                    self.profiler.record(Phase::Queue, queued);
                }
                match graph.vertex_id(cursor.current()) {
                    Some(vertex) => {
                        let path = graph.estimate_path(vertex, &self.options);
                        if path.depth == 0 && !path.reached_terminal {
                            self.pessimistic().with_touched(cursor.touched())
                        } else {
                            Estimate::from_path(path, cursor.touched())
                        }
                    }
                    None => self.pessimistic().with_touched(cursor.touched()),
                }
            }
            _ => self.pessimistic().with_touched(cursor.touched()),
        };
        if cursor.wrote() {
            estimate.read_only = false;
        }
        cursor.estimate = estimate.clone();
        self.profiler.record(Phase::Consume, start);
        trace!(
            txn = %txn_id,
            statement = %invocation.statement,
            partitions = estimate.partitions.len(),
            "estimator.consume"
        );
        self.shard(txn_id).lock().insert(txn_id, cursor);
        Ok(estimate)
    }

    /// Ends the transaction: queues its trace for learning, commit or abort alike,
    /// and releases the cursor.
    pub fn finalize(&self, txn_id: TxnId, outcome: Outcome) -> Result<()> {
        let mut cursor = self
            .shard(txn_id)
            .lock()
            .remove(&txn_id)
            .ok_or(MarkovError::UnknownTransaction(txn_id))?;
        let start = self.profiler.timer();
        let transitions = cursor.finish(outcome, Duration::ZERO);
        if self.config.learning {
            if let Some(graph) = cursor.graph.take() {
                let queued = self.profiler.timer();
                let steps = transitions.len();
                let accepted = self.learner.enqueue(LearningMessage::Trace { graph, transitions });
                self.profiler.record(Phase::Queue, queued);
                trace!(txn = %txn_id, ?outcome, steps, accepted, "estimator.finalize");
            }
        }
        self.pool.release(cursor);
        self.profiler.record(Phase::Finalize, start);
        Ok(())
    }

    /// Latest estimate held by an in-flight transaction's cursor.
    pub fn current_estimate(&self, txn_id: TxnId) -> Option<Estimate> {
        self.shard(txn_id)
            .lock()
            .get(&txn_id)
            .map(|cursor| cursor.estimate.clone())
    }

    /// Blocks until every update queued before the call has been applied.
    pub fn drain(&self) -> Result<()> {
        self.learner.drain()
    }

    /// Applies queued updates and stops the maintenance thread.
    pub fn shutdown(&self) {
        self.learner.shutdown();
    }

    /// Phase measurements and counters.
    pub fn profiler(&self) -> &EstimatorProfiler {
        &self.profiler
    }

    /// Cursor pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Learning queue counters.
    pub fn learner_stats(&self) -> LearnerStats {
        self.learner.stats()
    }

    /// Number of transactions with an open cursor.
    pub fn in_flight(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

impl Drop for MarkovEstimator {
    fn drop(&mut self) {
        self.learner.shutdown();
    }
}
