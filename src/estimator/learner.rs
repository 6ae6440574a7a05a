use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::graph::{MarkovGraph, ObservedTransition};
use crate::types::{MarkovError, Result};

pub(crate) enum LearningMessage {
    /// Completed trace of one transaction, terminal transition last.
    Trace {
        graph: Arc<MarkovGraph>,
        transitions: Vec<ObservedTransition>,
    },
    /// Single transition enqueued while the transaction runs.
    Transition {
        graph: Arc<MarkovGraph>,
        transition: ObservedTransition,
    },
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Counters describing the learning queue and its maintenance thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LearnerStats {
    /// Updates accepted by the queue.
    pub enqueued: u64,
    /// Updates dropped because the queue was full or closed.
    pub dropped: u64,
    /// Transitions applied to graphs.
    pub applied_transitions: u64,
    /// Batches drained by the maintenance thread.
    pub batches: u64,
    /// Updates that quarantined their graph.
    pub quarantined: u64,
    /// Updates discarded because their graph was already quarantined.
    pub ignored: u64,
    /// Transitions skipped because their source vertex was never reached.
    pub detached: u64,
}

#[derive(Default)]
struct LearnerCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    applied_transitions: AtomicU64,
    batches: AtomicU64,
    quarantined: AtomicU64,
    ignored: AtomicU64,
    detached: AtomicU64,
}

/// Bounded single-consumer update queue plus the thread draining it.
pub(crate) struct Learner {
    sender: SyncSender<LearningMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<LearnerCounters>,
}

impl Learner {
    pub(crate) fn spawn(capacity: usize, batch: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let counters = Arc::new(LearnerCounters::default());
        let worker_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name("markov-learner".into())
            .spawn(move || worker_loop(receiver, batch, worker_counters))?;
        debug!(capacity, batch, "estimator.learner.spawn");
        Ok(Self {
            sender,
            worker: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Enqueues without blocking. Returns `false` when the update was dropped.
    pub(crate) fn enqueue(&self, message: LearningMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "estimator.queue.full");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "estimator.queue.closed");
                false
            }
        }
    }

    /// Blocks until everything enqueued before the call has been applied.
    pub(crate) fn drain(&self) -> Result<()> {
        let (ack, done) = mpsc::channel();
        self.sender
            .send(LearningMessage::Flush(ack))
            .map_err(|_| MarkovError::LearnerStopped)?;
        done.recv().map_err(|_| MarkovError::LearnerStopped)
    }

    /// Applies outstanding updates, stops the worker and joins it. Idempotent.
    pub(crate) fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if self.sender.send(LearningMessage::Shutdown).is_err() {
            debug!("estimator.learner.already_stopped");
        }
        if handle.join().is_err() {
            warn!("estimator.learner.panicked");
        }
    }

    pub(crate) fn stats(&self) -> LearnerStats {
        let c = &self.counters;
        LearnerStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            applied_transitions: c.applied_transitions.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            quarantined: c.quarantined.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            detached: c.detached.load(Ordering::Relaxed),
        }
    }
}

fn worker_loop(receiver: Receiver<LearningMessage>, batch: usize, counters: Arc<LearnerCounters>) {
    let mut touched: Vec<Arc<MarkovGraph>> = Vec::new();
    let mut acks: Vec<mpsc::Sender<()>> = Vec::new();
    loop {
        let Ok(first) = receiver.recv() else {
            debug!("estimator.learner.disconnected");
            break;
        };
        let mut stop = false;
        let mut pending = Some(first);
        let mut taken = 0;
        while let Some(message) = pending.take() {
            taken += 1;
            match message {
                LearningMessage::Trace { graph, transitions } => {
                    apply(&graph, &transitions, &counters);
                    remember(&mut touched, graph);
                }
                LearningMessage::Transition { graph, transition } => {
                    apply(&graph, std::slice::from_ref(&transition), &counters);
                    remember(&mut touched, graph);
                }
                LearningMessage::Flush(ack) => acks.push(ack),
                LearningMessage::Shutdown => stop = true,
            }
            if !stop && taken < batch {
                pending = receiver.try_recv().ok();
            }
        }
        let recomputed: usize = touched.drain(..).map(|g| g.recompute_dirty()).sum();
        counters.batches.fetch_add(1, Ordering::Relaxed);
        trace!(messages = taken, recomputed, "estimator.learner.batch");
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
        if stop {
            debug!("estimator.learner.shutdown");
            break;
        }
    }
}

fn remember(touched: &mut Vec<Arc<MarkovGraph>>, graph: Arc<MarkovGraph>) {
    if !touched.iter().any(|g| Arc::ptr_eq(g, &graph)) {
        touched.push(graph);
    }
}

fn apply(graph: &MarkovGraph, transitions: &[ObservedTransition], counters: &LearnerCounters) {
    if graph.is_quarantined() {
        counters.ignored.fetch_add(1, Ordering::Relaxed);
        return;
    }
    for transition in transitions {
        match graph.add_observed_transition(transition) {
            Ok(true) => {
                counters.applied_transitions.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                counters.detached.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                counters.quarantined.fetch_add(1, Ordering::Relaxed);
                debug!(procedure = %graph.procedure(), error = %err, "estimator.learner.reject");
                return;
            }
        }
    }
}
