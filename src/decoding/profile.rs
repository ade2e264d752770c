//! Optional per-stage timing collection
//!
//! A profiler is owned by the caller and lent to a session; sessions run
//! the same way with or without one.

use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use super::ModelStage;

/// Receives the wall-clock duration of every successful stage invocation
pub trait StageProfiler {
    /// Record one invocation of `stage`
    fn record(&mut self, stage: ModelStage, elapsed: Duration);
}

/// Accumulated timing for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStat {
    /// Sum of all recorded durations
    pub total: Duration,
    /// Number of recorded invocations
    pub count: u32,
}

impl StageStat {
    /// Mean duration per invocation
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count
    }
}

/// Aggregates stage timings across one or more sessions
#[derive(Debug, Clone, Default)]
pub struct StageTimings {
    stats: HashMap<ModelStage, StageStat>,
}

impl StageTimings {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing for one stage, if it ran at least once
    pub fn get(&self, stage: ModelStage) -> Option<&StageStat> {
        self.stats.get(&stage)
    }

    /// Total time spent across all stages
    pub fn total(&self) -> Duration {
        self.stats.values().map(|s| s.total).sum()
    }

    /// Stages ordered by total time, slowest first
    pub fn ranked(&self) -> Vec<(ModelStage, StageStat)> {
        let mut ranked: Vec<_> = self.stats.iter().map(|(k, v)| (*k, *v)).collect();
        ranked.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        ranked
    }

    /// Log one line per stage
    pub fn log_summary(&self) {
        for (stage, stat) in self.ranked() {
            info!(
                "{}: {} calls, total {:.3}s, mean {:.2}ms",
                stage,
                stat.count,
                stat.total.as_secs_f64(),
                stat.mean().as_secs_f64() * 1000.0
            );
        }
    }
}

impl StageProfiler for StageTimings {
    fn record(&mut self, stage: ModelStage, elapsed: Duration) {
        let stat = self.stats.entry(stage).or_default();
        stat.total += elapsed;
        stat.count += 1;
    }
}
