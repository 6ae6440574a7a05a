#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use markov_estimator::graph::{ABORT_VERTEX, COMMIT_VERTEX, START_VERTEX};
use markov_estimator::{
    ClassificationId, Estimate, EstimatorConfig, GraphFamily, MarkovError, MarkovEstimator,
    Outcome, PartitionId, PartitionSet, ProcedureId, StatementId, StatementInvocation, TxnId,
    VertexKey,
};

const TRANSFER: ProcedureId = ProcedureId(0);
const READ: StatementId = StatementId(0);
const WRITE: StatementId = StatementId(1);

fn parts(ids: &[u32]) -> PartitionSet {
    ids.iter().copied().map(PartitionId).collect()
}

fn invoke(stmt: StatementId, ids: &[u32], read_only: bool) -> StatementInvocation {
    StatementInvocation::new(stmt, ids.iter().copied().map(PartitionId), read_only)
}

fn estimator(config: EstimatorConfig) -> (Arc<GraphFamily>, MarkovEstimator) {
    let family = Arc::new(GraphFamily::new());
    let estimator = MarkovEstimator::new(Arc::clone(&family), config).expect("estimator");
    (family, estimator)
}

fn run_transfer(estimator: &MarkovEstimator, txn: u64, outcome: Outcome) {
    let txn = TxnId(txn);
    estimator.estimate(txn, PartitionId(1), &[], TRANSFER);
    estimator
        .consume(txn, &invoke(READ, &[1], true), Duration::from_micros(20))
        .expect("consume read");
    estimator
        .consume(txn, &invoke(WRITE, &[1], false), Duration::from_micros(40))
        .expect("consume write");
    estimator.finalize(txn, outcome).expect("finalize");
}

fn train_transfer(estimator: &MarkovEstimator) {
    for txn in 0..8 {
        let outcome = if txn < 6 { Outcome::Commit } else { Outcome::Abort };
        run_transfer(estimator, txn, outcome);
    }
    estimator.drain().expect("drain");
}

#[test]
fn unseen_pair_falls_back_to_every_partition() {
    let (_, estimator) = estimator(EstimatorConfig::new(4));
    let estimate = estimator.estimate(TxnId(1), PartitionId(3), &[], ProcedureId(9));
    assert!(estimate.uncertain);
    assert_eq!(estimate.partitions, parts(&[0, 1, 2, 3]));
    assert_eq!(estimate.confidence, 0.0);
    assert_eq!(estimate, Estimate::pessimistic(4));
}

#[test]
fn learned_transfer_is_single_partition() {
    let (family, estimator) = estimator(EstimatorConfig::new(4).min_confidence(0.5));
    train_transfer(&estimator);

    let graph = family
        .get(ClassificationId(1), TRANSFER)
        .expect("graph created on first estimate");
    let read = graph
        .vertex_id(&VertexKey::query(READ, parts(&[1]), 0))
        .expect("read vertex");
    let write = graph
        .vertex_id(&VertexKey::query(WRITE, parts(&[1]), 0))
        .expect("write vertex");
    assert_eq!(graph.edge_count(START_VERTEX, read), 8);
    assert_eq!(graph.edge_count(read, write), 8);
    assert_eq!(graph.edge_count(write, COMMIT_VERTEX), 6);
    assert_eq!(graph.edge_count(write, ABORT_VERTEX), 2);
    assert_eq!(graph.vertex_read_only(write), Some(false));
    assert_eq!(graph.vertex_read_only(read), Some(true));

    let estimate = estimator.estimate(TxnId(100), PartitionId(1), &[], TRANSFER);
    assert_eq!(estimate.partitions, parts(&[1]));
    assert!(estimate.single_partition);
    assert!((estimate.confidence - 0.75).abs() < 1e-9);
    assert!(!estimate.uncertain);
    assert!((estimate.abort_probability - 0.25).abs() < 1e-9);
    assert!(!estimate.read_only);
    assert_eq!(estimator.current_estimate(TxnId(100)), Some(estimate));
}

#[test]
fn new_transition_is_learned_only_after_finalize_and_drain() {
    let (family, estimator) = estimator(EstimatorConfig::new(4));
    train_transfer(&estimator);
    let graph = family.get(ClassificationId(1), TRANSFER).expect("graph");
    let wide_write = VertexKey::query(WRITE, parts(&[1, 2]), 0);
    let prior = estimator.estimate(TxnId(49), PartitionId(1), &[], TRANSFER);

    let txn = TxnId(50);
    estimator.estimate(txn, PartitionId(1), &[], TRANSFER);
    estimator
        .consume(txn, &invoke(READ, &[1], true), Duration::ZERO)
        .expect("consume read");
    let refined = estimator
        .consume(txn, &invoke(WRITE, &[1, 2], false), Duration::ZERO)
        .expect("consume wide write");
    assert!(graph.vertex_id(&wide_write).is_none());
    // The vertex is unknown, so the live estimate is pessimistic but keeps what was touched.
    assert!(refined.uncertain);
    assert!(refined.partitions.contains(PartitionId(2)));

    // Nothing is queued until finalize, so other admissions still see the prior model.
    let unchanged = estimator.estimate(TxnId(51), PartitionId(1), &[], TRANSFER);
    assert_eq!(unchanged, prior);

    estimator.finalize(txn, Outcome::Commit).expect("finalize");
    estimator.drain().expect("drain");
    let vertex = graph.vertex_id(&wide_write).expect("learned vertex");
    let read = graph
        .vertex_id(&VertexKey::query(READ, parts(&[1]), 0))
        .expect("read vertex");
    assert_eq!(graph.edge_count(read, vertex), 1);
    let after = estimator.estimate(TxnId(52), PartitionId(1), &[], TRANSFER);
    assert_eq!(after.partitions, parts(&[1]));
    assert!(after.confidence < prior.confidence);
}

#[test]
fn earlier_write_keeps_live_estimate_read_write() {
    let (_, estimator) = estimator(EstimatorConfig::new(2));
    for txn in 0..4 {
        let txn = TxnId(txn);
        estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
        estimator
            .consume(txn, &invoke(WRITE, &[0], false), Duration::ZERO)
            .expect("consume write");
        estimator
            .consume(txn, &invoke(READ, &[0], true), Duration::ZERO)
            .expect("consume read");
        estimator.finalize(txn, Outcome::Commit).expect("finalize");
    }
    estimator.drain().expect("drain");

    let txn = TxnId(10);
    assert!(!estimator.estimate(txn, PartitionId(0), &[], TRANSFER).read_only);
    let after_write = estimator
        .consume(txn, &invoke(WRITE, &[0], false), Duration::ZERO)
        .expect("consume write");
    assert!(!after_write.read_only);
    // The remaining path is read-only, but the transaction has already written.
    let after_read = estimator
        .consume(txn, &invoke(READ, &[0], true), Duration::ZERO)
        .expect("consume read");
    assert!(!after_read.read_only);
    assert!(!after_read.uncertain);
    assert_eq!(estimator.current_estimate(txn), Some(after_read));
}

#[test]
fn consume_refines_toward_single_partition() {
    let (_, estimator) = estimator(EstimatorConfig::new(4));
    train_transfer(&estimator);
    let txn = TxnId(70);
    estimator.estimate(txn, PartitionId(1), &[], TRANSFER);
    let refined = estimator
        .consume(txn, &invoke(READ, &[1], true), Duration::ZERO)
        .expect("consume");
    assert_eq!(refined.partitions, parts(&[1]));
    assert!(refined.single_partition);
    assert!((refined.confidence - 0.75).abs() < 1e-9);
    assert_eq!(estimator.current_estimate(txn), Some(refined));
}

#[test]
fn abort_traces_are_learned() {
    let (family, estimator) = estimator(EstimatorConfig::new(2));
    let txn = TxnId(1);
    estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
    estimator
        .consume(txn, &invoke(READ, &[0], true), Duration::ZERO)
        .expect("consume");
    estimator.finalize(txn, Outcome::Abort).expect("finalize");
    estimator.drain().expect("drain");

    let graph = family.get(ClassificationId(0), TRANSFER).expect("graph");
    let read = graph
        .vertex_id(&VertexKey::query(READ, parts(&[0]), 0))
        .expect("read vertex");
    assert_eq!(graph.edge_count(read, ABORT_VERTEX), 1);
    assert_eq!(estimator.in_flight(), 0);
    assert!(matches!(
        estimator.finalize(txn, Outcome::Commit),
        Err(MarkovError::UnknownTransaction(_))
    ));
}

#[test]
fn repeated_statements_get_new_rounds() {
    let (family, estimator) = estimator(EstimatorConfig::new(2));
    let txn = TxnId(1);
    estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
    for _ in 0..3 {
        estimator
            .consume(txn, &invoke(READ, &[0], true), Duration::ZERO)
            .expect("consume");
    }
    estimator.finalize(txn, Outcome::Commit).expect("finalize");
    estimator.drain().expect("drain");
    let graph = family.get(ClassificationId(0), TRANSFER).expect("graph");
    for round in 0..3 {
        assert!(graph
            .vertex_id(&VertexKey::query(READ, parts(&[0]), round))
            .is_some());
    }
    assert_eq!(graph.vertex_count(), 6);
}

#[test]
fn learn_on_consume_enqueues_each_transition() {
    let (family, estimator) = estimator(EstimatorConfig::new(2).learn_on_consume(true));
    let txn = TxnId(1);
    estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
    estimator
        .consume(txn, &invoke(READ, &[0], true), Duration::ZERO)
        .expect("consume");
    estimator.drain().expect("drain");
    let graph = family.get(ClassificationId(0), TRANSFER).expect("graph");
    let read = graph
        .vertex_id(&VertexKey::query(READ, parts(&[0]), 0))
        .expect("learned before finalize");
    estimator.finalize(txn, Outcome::Commit).expect("finalize");
    estimator.drain().expect("drain");
    assert_eq!(graph.edge_count(START_VERTEX, read), 1);
    assert_eq!(graph.edge_count(read, COMMIT_VERTEX), 1);
    assert_eq!(estimator.learner_stats().applied_transitions, 2);
}

#[test]
fn disabled_learning_leaves_graphs_untouched() {
    let (family, estimator) = estimator(EstimatorConfig::new(2).learning(false));
    run_transfer(&estimator, 1, Outcome::Commit);
    estimator.drain().expect("drain");
    let graph = family.get(ClassificationId(1), TRANSFER).expect("graph");
    assert!(graph.is_untrained());
    assert_eq!(estimator.learner_stats().enqueued, 0);
}

#[test]
fn cursors_stay_isolated_across_threads() {
    let (_, estimator) = estimator(EstimatorConfig::new(8).cursor_pool_size(2));
    // One trained path per partition, all in the same graph.
    for k in 0..8u32 {
        let txn = TxnId(1_000 + u64::from(k));
        estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
        estimator
            .consume(txn, &invoke(READ, &[k], true), Duration::ZERO)
            .expect("consume");
        estimator.finalize(txn, Outcome::Commit).expect("finalize");
    }
    estimator.drain().expect("drain");

    let estimator = Arc::new(estimator);
    let handles: Vec<_> = (0..8u32)
        .map(|k| {
            let estimator = Arc::clone(&estimator);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let txn = TxnId(u64::from(k) * 10_000 + i);
                    estimator.estimate(txn, PartitionId(0), &[], TRANSFER);
                    let refined = estimator
                        .consume(txn, &invoke(READ, &[k], true), Duration::ZERO)
                        .expect("consume");
                    assert_eq!(refined.partitions, parts(&[k]));
                    assert_eq!(
                        estimator.current_estimate(txn).map(|e| e.partitions),
                        Some(parts(&[k]))
                    );
                    estimator.finalize(txn, Outcome::Commit).expect("finalize");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }
    assert_eq!(estimator.in_flight(), 0);
}

#[test]
fn pool_exhaustion_allocates_and_counts() {
    let (_, estimator) = estimator(EstimatorConfig::new(1).cursor_pool_size(1));
    for txn in 0..3 {
        estimator.estimate(TxnId(txn), PartitionId(0), &[], TRANSFER);
    }
    let stats = estimator.pool_stats();
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.exhausted, 2);
    assert_eq!(estimator.in_flight(), 3);
    for txn in 0..3 {
        estimator.finalize(TxnId(txn), Outcome::Commit).expect("finalize");
    }
    let stats = estimator.pool_stats();
    assert_eq!(stats.released, 3);
    assert_eq!(stats.discarded, 2);
    assert_eq!(stats.idle, 1);
}

#[test]
fn small_queue_accounts_for_every_trace() {
    let (_, estimator) = estimator(EstimatorConfig::new(2).queue_capacity(1).learner_batch(1));
    for txn in 0..200 {
        run_transfer(&estimator, txn, Outcome::Commit);
    }
    estimator.drain().expect("drain");
    let stats = estimator.learner_stats();
    assert_eq!(stats.enqueued + stats.dropped, 200);
    assert_eq!(stats.applied_transitions, 3 * stats.enqueued);
}

#[test]
fn shutdown_applies_queued_traces() {
    let (family, estimator) = estimator(EstimatorConfig::new(2));
    run_transfer(&estimator, 1, Outcome::Commit);
    estimator.shutdown();
    let graph = family.get(ClassificationId(1), TRANSFER).expect("graph");
    assert_eq!(graph.edge_total(), 3);
    assert!(matches!(estimator.drain(), Err(MarkovError::LearnerStopped)));
}

#[test]
fn profiler_tracks_phases() {
    let (_, estimator) = estimator(EstimatorConfig::new(2).profiling(true));
    run_transfer(&estimator, 1, Outcome::Commit);
    estimator.estimate(TxnId(2), PartitionId(1), &[], TRANSFER);
    let snapshot = estimator.profiler().snapshot();
    let count = |name: &str| {
        snapshot
            .phases
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.invocations)
            .unwrap_or_default()
    };
    assert_eq!(count("cache"), 2);
    assert_eq!(count("compute"), 2);
    assert_eq!(count("consume"), 2);
    assert_eq!(count("finalize"), 1);
    assert_eq!(count("queue"), 1);
    assert_eq!(snapshot.cache_attempts, 2);
    assert_eq!(snapshot.cache_hits, 1);
}
