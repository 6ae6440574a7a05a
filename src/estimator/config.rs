use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::graph::PathOptions;
use crate::types::{MarkovError, Result};

/// Runtime tuning for [`MarkovEstimator`](super::MarkovEstimator).
///
/// Loadable from TOML; every field falls back to its default when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Number of partitions in the cluster; the pessimistic estimate touches all of them.
    pub num_partitions: u32,
    /// Chosen edges below this probability mark an estimate uncertain.
    pub min_confidence: f64,
    /// Maximum number of edges followed by one path walk.
    pub max_depth: usize,
    /// Capacity of the learning queue; enqueues beyond it are dropped.
    pub queue_capacity: usize,
    /// Maximum queued messages applied before probabilities are recomputed.
    pub learner_batch: usize,
    /// Cursors pre-allocated and retained per partition.
    pub cursor_pool_size: usize,
    /// Number of shards in the in-flight cursor table.
    pub in_flight_shards: usize,
    /// Enqueue each transition as it is consumed instead of the whole trace at finalize.
    pub learn_on_consume: bool,
    /// Feed observed traces back into the graphs.
    pub learning: bool,
    /// Record phase timings in the profiler.
    pub profiling: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            min_confidence: 0.5,
            max_depth: 64,
            queue_capacity: 16_384,
            learner_batch: 256,
            cursor_pool_size: 64,
            in_flight_shards: 16,
            learn_on_consume: false,
            learning: true,
            profiling: true,
        }
    }
}

impl EstimatorConfig {
    /// Default configuration for a cluster of `num_partitions` partitions.
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions,
            ..Self::default()
        }
    }

    /// Sets the number of partitions.
    pub fn num_partitions(mut self, value: u32) -> Self {
        self.num_partitions = value;
        self
    }

    /// Sets the minimum edge probability below which an estimate is uncertain.
    pub fn min_confidence(mut self, value: f64) -> Self {
        self.min_confidence = value;
        self
    }

    /// Sets the path walk depth bound.
    pub fn max_depth(mut self, value: usize) -> Self {
        self.max_depth = value;
        self
    }

    /// Sets the learning queue capacity.
    pub fn queue_capacity(mut self, value: usize) -> Self {
        self.queue_capacity = value;
        self
    }

    /// Sets the learner batch size.
    pub fn learner_batch(mut self, value: usize) -> Self {
        self.learner_batch = value;
        self
    }

    /// Sets the per-partition cursor pool size.
    pub fn cursor_pool_size(mut self, value: usize) -> Self {
        self.cursor_pool_size = value;
        self
    }

    /// Sets the number of in-flight table shards.
    pub fn in_flight_shards(mut self, value: usize) -> Self {
        self.in_flight_shards = value;
        self
    }

    /// Enables per-transition learning during `consume`.
    pub fn learn_on_consume(mut self, value: bool) -> Self {
        self.learn_on_consume = value;
        self
    }

    /// Enables or disables online learning.
    pub fn learning(mut self, value: bool) -> Self {
        self.learning = value;
        self
    }

    /// Enables or disables phase timing.
    pub fn profiling(mut self, value: bool) -> Self {
        self.profiling = value;
        self
    }

    /// Checks that every field is in range.
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(MarkovError::InvalidConfig(
                "num_partitions must be at least 1".into(),
            ));
        }
        if i32::try_from(self.num_partitions).is_err() {
            return Err(MarkovError::InvalidConfig(format!(
                "num_partitions {} exceeds the classification id range",
                self.num_partitions
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(MarkovError::InvalidConfig(format!(
                "min_confidence {} outside [0, 1]",
                self.min_confidence
            )));
        }
        if self.max_depth == 0 {
            return Err(MarkovError::InvalidConfig("max_depth must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(MarkovError::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn normalize(mut self) -> Self {
        if self.learner_batch == 0 {
            self.learner_batch = 1;
        }
        if self.in_flight_shards == 0 {
            self.in_flight_shards = 1;
        }
        self
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Walk options derived from this configuration.
    pub fn path_options(&self) -> PathOptions {
        PathOptions {
            max_depth: self.max_depth,
            min_confidence: self.min_confidence,
        }
    }
}
