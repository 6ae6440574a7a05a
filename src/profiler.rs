//! Phase timers and counters for the runtime estimator.
//!
//! Values are accumulated with relaxed atomics on the transaction threads and read
//! by an external stats collector, which also owns the reset policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Accumulated elapsed time and invocation count for one named phase.
#[derive(Debug)]
pub struct ProfileMeasurement {
    name: &'static str,
    total_nanos: AtomicU64,
    invocations: AtomicU64,
}

impl ProfileMeasurement {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            total_nanos: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    /// Phase name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sum of recorded elapsed nanoseconds.
    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    /// Number of recorded invocations.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Mean nanoseconds per invocation, zero when nothing was recorded.
    pub fn average_nanos(&self) -> f64 {
        match self.invocations() {
            0 => 0.0,
            n => self.total_nanos() as f64 / n as f64,
        }
    }

    fn record(&self, nanos: u64) {
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeroes both accumulators.
    pub fn reset(&self) {
        self.total_nanos.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
    }
}

/// Estimator phases that are timed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Graph selection for an admitted transaction.
    Cache,
    /// Path walk at admission.
    Compute,
    /// Cursor advance plus refinement walk.
    Consume,
    /// Trace hand-off and cursor release.
    Finalize,
    /// Learning-queue enqueue.
    Queue,
}

impl Phase {
    /// Every phase, in reporting order.
    pub const ALL: [Phase; 5] = [
        Phase::Cache,
        Phase::Compute,
        Phase::Consume,
        Phase::Finalize,
        Phase::Queue,
    ];

    /// Lower-case phase name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Cache => "cache",
            Phase::Compute => "compute",
            Phase::Consume => "consume",
            Phase::Finalize => "finalize",
            Phase::Queue => "queue",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Serializable copy of one measurement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    /// Phase name.
    pub name: &'static str,
    /// Sum of elapsed nanoseconds.
    pub total_nanos: u64,
    /// Invocation count.
    pub invocations: u64,
}

/// Serializable copy of the whole profiler.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProfilerSnapshot {
    /// Phases in reporting order.
    pub phases: Vec<PhaseSnapshot>,
    /// Graph lookups attempted.
    pub cache_attempts: u64,
    /// Graph lookups that found a usable graph.
    pub cache_hits: u64,
    /// Estimates answered with the pessimistic default.
    pub fallbacks: u64,
}

/// Phase measurements plus lookup counters owned by one estimator.
#[derive(Debug)]
pub struct EstimatorProfiler {
    enabled: bool,
    phases: [ProfileMeasurement; 5],
    cache_attempts: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
}

impl EstimatorProfiler {
    /// Creates a profiler; timing is skipped entirely when `enabled` is false.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            phases: Phase::ALL.map(|phase| ProfileMeasurement::new(phase.name())),
            cache_attempts: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Whether phase timing is recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn timer(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(crate) fn record(&self, phase: Phase, start: Option<Instant>) {
        let Some(start) = start else {
            return;
        };
        let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.phases[phase.index()].record(nanos);
    }

    pub(crate) fn cache_lookup(&self, hit: bool) {
        self.cache_attempts.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Measurements in reporting order.
    pub fn measurements(&self) -> &[ProfileMeasurement] {
        &self.phases
    }

    /// Measurement for one phase.
    pub fn measurement(&self, phase: Phase) -> &ProfileMeasurement {
        &self.phases[phase.index()]
    }

    /// Graph lookups attempted.
    pub fn cache_attempts(&self) -> u64 {
        self.cache_attempts.load(Ordering::Relaxed)
    }

    /// Graph lookups that found a usable graph.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Estimates answered with the pessimistic default.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Copies every measurement and counter.
    pub fn snapshot(&self) -> ProfilerSnapshot {
        ProfilerSnapshot {
            phases: self
                .phases
                .iter()
                .map(|m| PhaseSnapshot {
                    name: m.name(),
                    total_nanos: m.total_nanos(),
                    invocations: m.invocations(),
                })
                .collect(),
            cache_attempts: self.cache_attempts(),
            cache_hits: self.cache_hits(),
            fallbacks: self.fallbacks(),
        }
    }

    /// Zeroes every measurement and counter.
    pub fn reset(&self) {
        for phase in &self.phases {
            phase.reset();
        }
        self.cache_attempts.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
    }
}
