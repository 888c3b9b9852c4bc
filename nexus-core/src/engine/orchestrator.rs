//! Engine - lifecycle owner of the worker pool, block pool and metrics.
//!
//! # Performance-First Design:
//! - **Shared state cell**: engine and workers read one atomic, no lock
//! - **Injected metrics sink**: callers may share one collector between engines
//! - **Config frozen while active**: reconfiguration never races running workers

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::memory_pool::MemoryPool;
use super::state::{EngineState, StateCell};
use crate::config::EngineConfig;
use crate::error::{NexusError, Result};
use crate::executor::{PoolConfig, Priority, ScaleDecision, TaskHandle, TaskStats, WorkerPool};
use crate::metrics::{AggregatedMetrics, MetricsCollector};

struct CpuSample {
    at: Instant,
    busy: Duration,
}

/// In-process execution engine.
///
/// ```no_run
/// use nexus_core::{Engine, EngineConfig};
///
/// let engine = Engine::new(EngineConfig::with_threads(4))?;
/// engine.start()?;
/// let handle = engine.submit(|| 6 * 7)?;
/// assert_eq!(handle.wait(), Ok(42));
/// engine.stop();
/// # Ok::<(), nexus_core::NexusError>(())
/// ```
pub struct Engine {
    config: RwLock<EngineConfig>,
    state: Arc<StateCell>,
    metrics: Arc<MetricsCollector>,
    pool: WorkerPool,
    blocks: RwLock<Arc<MemoryPool>>,
    cpu_sample: Mutex<CpuSample>,
    lifecycle: Mutex<()>,
}

impl Engine {
    /// Build a stopped engine with its own metrics collector.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let metrics = MetricsCollector::with_max_samples(config.max_samples)?;
        Self::with_metrics(config, Arc::new(metrics))
    }

    /// Build a stopped engine recording into an existing collector.
    pub fn with_metrics(config: EngineConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        config.validate()?;
        info!(
            threads = config.num_threads,
            queue_capacity = config.queue_capacity,
            block_size = config.block_size,
            block_count = config.block_count,
            "Creating engine"
        );

        let state = Arc::new(StateCell::new());
        let pool = WorkerPool::with_state(
            PoolConfig::from(&config),
            Arc::clone(&state),
            Some(Arc::clone(&metrics)),
        )?;
        pool.set_recording(config.enable_metrics);
        let blocks = MemoryPool::new(config.block_size, config.block_count)?;

        Ok(Self {
            config: RwLock::new(config),
            state,
            metrics,
            pool,
            blocks: RwLock::new(blocks),
            cpu_sample: Mutex::new(CpuSample {
                at: Instant::now(),
                busy: Duration::ZERO,
            }),
            lifecycle: Mutex::new(()),
        })
    }

    /// Stopped -> Running, spawning `num_threads` workers.
    ///
    /// Returns `Ok(false)` without side effects from any other state.
    pub fn start(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock();
        let started = self.pool.start()?;
        if started {
            self.metrics.record_active_threads(self.pool.active_threads());
            info!(threads = self.pool.active_threads(), "Engine started");
        }
        Ok(started)
    }

    /// Running/Paused -> Stopped; joins all workers and cancels queued
    /// tasks before returning.
    pub fn stop(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let stopped = self.pool.stop();
        self.metrics.record_active_threads(self.pool.active_threads());
        if stopped {
            info!("Engine stopped");
        }
        stopped
    }

    pub fn pause(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        self.pool.pause()
    }

    pub fn resume(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        self.pool.resume()
    }

    pub fn state(&self) -> EngineState {
        self.state.load()
    }

    pub fn get_state(&self) -> EngineState {
        self.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Move to `Error` from any state.  Workers exit after their current
    /// task; submissions are refused until [`reset`](Self::reset).
    ///
    /// Safe to call from inside a task.
    pub fn fault(&self, reason: &str) -> EngineState {
        let previous = self.state.force(EngineState::Error);
        self.pool.wake();
        error!(reason, previous = %previous, "Engine fault");
        previous
    }

    /// Error -> Stopped after joining the remaining workers.
    ///
    /// Must not be called from a task running on this engine.
    pub fn reset(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        if self.state.load() != EngineState::Error {
            return false;
        }
        self.pool.halt();
        let recovered = self
            .state
            .transition(EngineState::Error, EngineState::Stopped);
        self.metrics.record_active_threads(self.pool.active_threads());
        if recovered {
            info!("Engine reset after fault");
        }
        recovered
    }

    pub fn submit<F, R>(&self, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.pool.submit(work)
    }

    pub fn submit_with_priority<F, R>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.pool.submit_with_priority(priority, work)
    }

    /// See [`WorkerPool::submit_fallible`].
    pub fn submit_fallible<F, R, E>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: std::fmt::Display,
    {
        self.pool.submit_fallible(priority, work)
    }

    /// See [`WorkerPool::submit_batch`]; chunks follow `config.batch_size`.
    pub fn submit_batch<I, F, R>(&self, priority: Priority, tasks: I) -> Result<Vec<TaskHandle<R>>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.pool.submit_batch(priority, tasks)
    }

    /// Run `work` with exclusive use of a zeroed block from the engine's
    /// memory pool.  The block is claimed at submission and returned when
    /// the task finishes, fails or is cancelled.
    pub fn submit_with_block<F, R>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce(&mut [u8]) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut block = self.block_pool().try_allocate()?;
        self.pool
            .submit_with_priority(priority, move || work(&mut block))
    }

    /// Block until every accepted task has completed or been cancelled.
    pub fn wait_all(&self) {
        self.pool.wait_all();
    }

    /// [`wait_all`](Self::wait_all) bounded by `config.timeout`.
    pub fn wait_idle(&self) -> Result<()> {
        let timeout = self.config.read().timeout;
        if self.pool.wait_all_timeout(timeout) {
            Ok(())
        } else {
            warn!(?timeout, pending = self.pool.queue_depth(), "Engine did not go idle");
            Err(NexusError::Timeout(timeout))
        }
    }

    /// Apply one auto-scaling step.
    pub fn rebalance(&self) -> ScaleDecision {
        let _lifecycle = self.lifecycle.lock();
        let decision = self.pool.rebalance();
        self.metrics.record_active_threads(self.pool.active_threads());
        decision
    }

    /// Replace the configuration.  Only allowed while stopped.
    pub fn set_config(&self, config: EngineConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state.load();
        if state != EngineState::Stopped {
            warn!(%state, "Configuration change rejected while engine is active");
            return Err(NexusError::ConfigLocked(state));
        }
        config.validate()?;

        let current = self.config.read().clone();
        let rebuilt_blocks = if (config.block_size, config.block_count)
            != (current.block_size, current.block_count)
        {
            Some(MemoryPool::new(config.block_size, config.block_count)?)
        } else {
            None
        };
        self.pool.reconfigure(PoolConfig::from(&config))?;
        self.pool.set_recording(config.enable_metrics);
        if let Some(blocks) = rebuilt_blocks {
            // Blocks still held by callers return to the pool they came from.
            *self.blocks.write() = blocks;
        }
        if config.max_samples != current.max_samples {
            debug!(
                max_samples = config.max_samples,
                "Sample window is fixed at construction; change ignored"
            );
        }

        info!(
            threads = config.num_threads,
            queue_capacity = config.queue_capacity,
            "Engine reconfigured"
        );
        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Refresh the gauges (queue depth, workers, CPU estimate, block
    /// memory) and aggregate.
    pub fn metrics_snapshot(&self) -> AggregatedMetrics {
        self.refresh_gauges();
        self.metrics.get_aggregated()
    }

    pub fn metrics_json(&self) -> serde_json::Result<String> {
        self.refresh_gauges();
        self.metrics.to_json()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
        *self.cpu_sample.lock() = CpuSample {
            at: Instant::now(),
            busy: self.pool.busy_time(),
        };
        debug!("Engine metrics reset");
    }

    pub fn block_pool(&self) -> Arc<MemoryPool> {
        self.blocks.read().clone()
    }

    pub fn task_stats(&self) -> TaskStats {
        self.pool.stats()
    }

    pub fn active_threads(&self) -> usize {
        self.pool.active_threads()
    }

    pub fn queue_depth(&self) -> usize {
        self.pool.queue_depth()
    }

    fn refresh_gauges(&self) {
        self.metrics.record_queue_size(self.pool.queue_depth());
        self.metrics.record_active_threads(self.pool.active_threads());
        self.metrics
            .record_memory_usage(self.block_pool().allocated_bytes());
        self.metrics.record_cpu_usage(self.sample_cpu());
    }

    /// Share of all cores spent inside tasks since the previous sample.
    fn sample_cpu(&self) -> f64 {
        let mut sample = self.cpu_sample.lock();
        let now = Instant::now();
        let busy = self.pool.busy_time();
        let wall = now.duration_since(sample.at);
        let spent = busy.saturating_sub(sample.busy);
        *sample = CpuSample { at: now, busy };

        if wall.is_zero() {
            return 0.0;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (spent.as_secs_f64() / (wall.as_secs_f64() * cores as f64) * 100.0).clamp(0.0, 100.0)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
