//! Advisory worker auto-scaling.
//!
//! The pool never resizes on its own; [`WorkerPool::rebalance`] asks a
//! [`ScalingPolicy`] for a decision against the current load and applies it
//! within the configured thread bounds.
//!
//! [`WorkerPool::rebalance`]: super::WorkerPool::rebalance

use serde::Serialize;

/// Point-in-time load of a worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    pub queue_depth: usize,
    pub workers: usize,
    pub idle_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Grow once the backlog exceeds this many tasks per worker.
    pub backlog_per_worker: usize,
    /// Shrink once at least this fraction of workers sits idle on an empty queue.
    pub idle_fraction: f64,
}

impl ScalingPolicy {
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self {
            min_threads,
            max_threads,
            backlog_per_worker: 4,
            idle_fraction: 0.5,
        }
    }

    pub fn evaluate(&self, load: &LoadSnapshot) -> ScaleDecision {
        let workers = load.workers;
        if workers < self.min_threads {
            return ScaleDecision::Grow(self.min_threads - workers);
        }
        if workers > self.max_threads {
            return ScaleDecision::Shrink(workers - self.max_threads);
        }

        let backlog_limit = workers.max(1) * self.backlog_per_worker;
        if load.queue_depth > backlog_limit && load.idle_workers == 0 && workers < self.max_threads {
            let wanted = load.queue_depth.div_ceil(self.backlog_per_worker.max(1));
            let grow = wanted.saturating_sub(workers).clamp(1, self.max_threads - workers);
            return ScaleDecision::Grow(grow);
        }

        if load.queue_depth == 0 && workers > self.min_threads && workers > 0 {
            let idle_ratio = load.idle_workers as f64 / workers as f64;
            if idle_ratio >= self.idle_fraction {
                let shrink = (load.idle_workers / 2).clamp(1, workers - self.min_threads);
                return ScaleDecision::Shrink(shrink);
            }
        }

        ScaleDecision::Hold
    }
}
