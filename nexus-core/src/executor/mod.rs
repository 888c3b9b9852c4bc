//! Priority worker pool.
//!
//! A fixed set of OS threads pulls tasks from a three-tier queue: every
//! pending `High` task runs before any `Normal` one, and `Normal` before
//! `Low`.  Within a tier tasks start in submission order.
//!
//! # Performance-First Design:
//! - **One lock per submit**: the queue mutex is the only shared lock on the
//!   hot path; counters are atomics
//! - **No busy waiting**: idle and paused workers park on a condvar
//! - **Panic isolation**: a panicking task resolves its handle with an error
//!   and the worker keeps serving
//! - **Advisory scaling**: resizing only happens through [`WorkerPool::rebalance`]

mod queue;
pub mod scaling;
pub mod task;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{EngineState, StateCell};
use crate::error::{NexusError, Result, TaskError};
use crate::metrics::{MetricsCollector, OperationTimer};

use queue::TaskQueue;
pub use scaling::{LoadSnapshot, ScaleDecision, ScalingPolicy};
use task::Job;
pub use task::{Priority, TaskHandle};

/// Upper bound on how long a parked worker sleeps before re-checking state.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Sizing of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub num_threads: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            num_threads: config.num_threads,
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            queue_capacity: config.queue_capacity,
            batch_size: config.batch_size,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Task counters since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub avg_task_time_us: f64,
}

struct Shared {
    state: Arc<StateCell>,
    metrics: Option<Arc<MetricsCollector>>,
    record_metrics: AtomicBool,
    queue: Mutex<TaskQueue>,
    work_available: Condvar,
    done_lock: Mutex<()>,
    all_done: Condvar,
    queue_capacity: AtomicUsize,
    next_task_id: AtomicU64,
    next_worker_id: AtomicUsize,
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    cancelled_tasks: AtomicU64,
    task_time_us: AtomicU64,
    busy_ns: AtomicU64,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    retire_requests: AtomicUsize,
}

impl Shared {
    fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics
            .as_deref()
            .filter(|_| self.record_metrics.load(Ordering::Relaxed))
    }

    fn finished(&self) -> u64 {
        self.completed_tasks.load(Ordering::Acquire) + self.cancelled_tasks.load(Ordering::Acquire)
    }

    fn is_drained(&self) -> bool {
        self.finished() >= self.total_tasks.load(Ordering::Acquire)
    }

    fn notify_if_drained(&self) {
        if self.is_drained() {
            let _guard = self.done_lock.lock();
            self.all_done.notify_all();
        }
    }

    /// Wake every parked worker so it re-reads the pool state.
    fn wake_workers(&self) {
        let _queue = self.queue.lock();
        self.work_available.notify_all();
    }

    fn try_retire(&self) -> bool {
        self.retire_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn execute(&self, job: Job) {
        let task_id = job.id;
        let started = Instant::now();
        let timer = self
            .metrics()
            .map(|metrics| OperationTimer::since(metrics, job.submitted_at));

        let success = job.run();

        let run_time = started.elapsed();
        if let Some(timer) = timer {
            timer.finish(success);
        }
        self.busy_ns
            .fetch_add(run_time.as_nanos() as u64, Ordering::Relaxed);
        self.task_time_us
            .fetch_add(run_time.as_micros() as u64, Ordering::Relaxed);
        if !success {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            warn!(task_id, "Task failed");
        }
        self.completed_tasks.fetch_add(1, Ordering::AcqRel);
        self.notify_if_drained();
    }

    fn cancel_pending(&self) -> usize {
        let drained = {
            let mut queue = self.queue.lock();
            let drained = queue.drain();
            self.cancelled_tasks
                .fetch_add(drained.len() as u64, Ordering::AcqRel);
            drained
        };
        if let Some(metrics) = self.metrics() {
            metrics.record_queue_size(0);
        }
        let cancelled = drained.len();
        // Dropping a job resolves its handle with `Cancelled`.
        drop(drained);
        if cancelled > 0 {
            info!(cancelled, "Cancelled pending tasks");
        }
        self.notify_if_drained();
        cancelled
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                let state = shared.state.load();
                if state.is_terminal_for_workers() {
                    break None;
                }
                if state == EngineState::Running {
                    if let Some(job) = queue.pop() {
                        if let Some(metrics) = shared.metrics() {
                            metrics.record_queue_size(queue.len());
                        }
                        break Some(job);
                    }
                    if shared.try_retire() {
                        debug!(worker_id, "Worker retiring");
                        break None;
                    }
                }
                shared.idle_workers.fetch_add(1, Ordering::Relaxed);
                shared.work_available.wait_for(&mut queue, IDLE_POLL);
                shared.idle_workers.fetch_sub(1, Ordering::Relaxed);
            }
        };
        match job {
            Some(job) => shared.execute(job),
            None => break,
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
    debug!(worker_id, "Worker exited");
}

/// Thread pool executing prioritized closures.
///
/// The pool shares its [`StateCell`] with the owning engine; a standalone
/// pool gets its own.  Workers exist only between `start` and `stop`.
pub struct WorkerPool {
    shared: Arc<Shared>,
    config: RwLock<PoolConfig>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Standalone pool with its own lifecycle state and no metrics.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_state(config, Arc::new(StateCell::new()), None)
    }

    pub(crate) fn with_state(
        config: PoolConfig,
        state: Arc<StateCell>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        validate(&config)?;
        info!(
            threads = config.num_threads,
            queue_capacity = config.queue_capacity,
            "Creating worker pool"
        );
        let shared = Shared {
            state,
            record_metrics: AtomicBool::new(metrics.is_some()),
            metrics,
            queue: Mutex::new(TaskQueue::new()),
            work_available: Condvar::new(),
            done_lock: Mutex::new(()),
            all_done: Condvar::new(),
            queue_capacity: AtomicUsize::new(config.queue_capacity),
            next_task_id: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            cancelled_tasks: AtomicU64::new(0),
            task_time_us: AtomicU64::new(0),
            busy_ns: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            retire_requests: AtomicUsize::new(0),
        };
        Ok(Self {
            shared: Arc::new(shared),
            config: RwLock::new(config),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn `num_threads` workers and enter `Running`.
    ///
    /// Returns `Ok(false)` when the pool was not stopped.
    pub fn start(&self) -> Result<bool> {
        let mut workers = self.workers.lock();
        if !self
            .shared
            .state
            .transition(EngineState::Stopped, EngineState::Running)
        {
            debug!(state = %self.shared.state.load(), "Start ignored");
            return Ok(false);
        }

        let threads = self.config.read().num_threads;
        for _ in 0..threads {
            if let Err(err) = self.spawn_worker(&mut workers) {
                error!(error = %err, "Failed to spawn worker, rolling back start");
                self.shared.state.force(EngineState::Stopped);
                self.join_workers(&mut workers);
                return Err(err);
            }
        }
        info!(threads, "Worker pool started");
        Ok(true)
    }

    /// Leave `Running` or `Paused`, join every worker and cancel whatever
    /// is still queued.  Returns `false` if the pool was not active.
    pub fn stop(&self) -> bool {
        let mut workers = self.workers.lock();
        let state = &self.shared.state;
        // pause/resume may flip the state between reads; retry until this
        // call wins or the pool is already inactive.
        let stopped = loop {
            match state.load() {
                EngineState::Stopped | EngineState::Error => break false,
                current => {
                    if state.transition(current, EngineState::Stopped) {
                        break true;
                    }
                }
            }
        };
        self.join_workers(&mut workers);
        self.shared.cancel_pending();
        if stopped {
            info!("Worker pool stopped");
        }
        stopped
    }

    /// Join workers without touching the lifecycle state; used after the
    /// owner forced `Error`.
    pub(crate) fn halt(&self) {
        let mut workers = self.workers.lock();
        self.join_workers(&mut workers);
        self.shared.cancel_pending();
    }

    /// Wake workers after the owner changed the shared state directly.
    pub(crate) fn wake(&self) {
        self.shared.wake_workers();
    }

    /// Stop dispatching; queued tasks stay queued and new submissions are
    /// still accepted.
    pub fn pause(&self) -> bool {
        let paused = self
            .shared
            .state
            .transition(EngineState::Running, EngineState::Paused);
        if paused {
            info!("Worker pool paused");
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self
            .shared
            .state
            .transition(EngineState::Paused, EngineState::Running);
        if resumed {
            self.shared.wake_workers();
            info!("Worker pool resumed");
        }
        resumed
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    /// Submit at [`Priority::Normal`].
    pub fn submit<F, R>(&self, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit_with_priority(Priority::Normal, work)
    }

    pub fn submit_with_priority<F, R>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.enqueue(priority, move || Ok(work()))
    }

    /// Submit a fallible task; an `Err` resolves the handle with
    /// [`TaskError::Failed`] and counts as a failed task.
    pub fn submit_fallible<F, R, E>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: std::fmt::Display,
    {
        self.enqueue(priority, move || {
            work().map_err(|err| TaskError::Failed(err.to_string()))
        })
    }

    /// Enqueue many tasks, taking the queue lock once per `batch_size` tasks.
    ///
    /// Stops at the first chunk that no longer fits; tasks from that chunk
    /// onward are dropped.  The returned handles belong to the accepted
    /// prefix, so a short vector signals back-pressure.
    pub fn submit_batch<I, F, R>(&self, priority: Priority, tasks: I) -> Result<Vec<TaskHandle<R>>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let batch_size = self.config.read().batch_size;
        let mut tasks = tasks.into_iter().peekable();
        let mut handles = Vec::new();

        while tasks.peek().is_some() {
            let mut chunk = Vec::with_capacity(batch_size);
            for work in tasks.by_ref().take(batch_size) {
                let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
                chunk.push(Job::new(id, priority, move || Ok(work())));
            }

            {
                let mut queue = self.shared.queue.lock();
                let state = self.shared.state.load();
                if !state.accepts_work() {
                    if handles.is_empty() {
                        return Err(NexusError::NotAccepting(state));
                    }
                    break;
                }
                let capacity = self.shared.queue_capacity.load(Ordering::Relaxed);
                if queue.len() + chunk.len() > capacity {
                    warn!(
                        accepted = handles.len(),
                        capacity, "Batch submission hit queue capacity"
                    );
                    break;
                }
                self.shared
                    .total_tasks
                    .fetch_add(chunk.len() as u64, Ordering::AcqRel);
                for (job, handle) in chunk {
                    queue.push(job);
                    handles.push(handle);
                }
                if let Some(metrics) = self.shared.metrics() {
                    metrics.record_queue_size(queue.len());
                }
            }
            self.shared.work_available.notify_all();
        }

        debug!(tasks = handles.len(), %priority, "Batch submitted");
        Ok(handles)
    }

    fn enqueue<F, R>(&self, priority: Priority, work: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> std::result::Result<R, TaskError> + Send + 'static,
        R: Send + 'static,
    {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (job, handle) = Job::new(id, priority, work);
        {
            let mut queue = self.shared.queue.lock();
            // Checked under the queue lock so a concurrent stop either
            // drains this job or rejects it.
            let state = self.shared.state.load();
            if !state.accepts_work() {
                return Err(NexusError::NotAccepting(state));
            }
            let capacity = self.shared.queue_capacity.load(Ordering::Relaxed);
            if queue.len() >= capacity {
                warn!(task_id = id, capacity, "Task queue full");
                return Err(NexusError::QueueFull { capacity });
            }
            queue.push(job);
            self.shared.total_tasks.fetch_add(1, Ordering::AcqRel);
            if let Some(metrics) = self.shared.metrics() {
                metrics.record_queue_size(queue.len());
            }
        }
        self.shared.work_available.notify_one();
        Ok(handle)
    }

    /// Block until every accepted task has completed or been cancelled.
    ///
    /// While paused this waits for a `resume` (or `stop`).
    pub fn wait_all(&self) {
        let mut guard = self.shared.done_lock.lock();
        while !self.shared.is_drained() {
            self.shared.all_done.wait(&mut guard);
        }
    }

    /// Like [`wait_all`](Self::wait_all) with a deadline; `false` on timeout.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.done_lock.lock();
        while !self.shared.is_drained() {
            if self
                .shared
                .all_done
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.shared.is_drained();
            }
        }
        true
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Worker threads currently alive.
    pub fn active_threads(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.shared.idle_workers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TaskStats {
        let completed = self.shared.completed_tasks.load(Ordering::Acquire);
        let task_time_us = self.shared.task_time_us.load(Ordering::Relaxed);
        TaskStats {
            total_tasks: self.shared.total_tasks.load(Ordering::Acquire),
            completed_tasks: completed,
            failed_tasks: self.shared.failed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.shared.cancelled_tasks.load(Ordering::Acquire),
            avg_task_time_us: if completed == 0 {
                0.0
            } else {
                task_time_us as f64 / completed as f64
            },
        }
    }

    /// Cumulative wall time workers spent inside tasks.
    pub fn busy_time(&self) -> Duration {
        Duration::from_nanos(self.shared.busy_ns.load(Ordering::Relaxed))
    }

    /// Toggle task timing and queue gauges; no-op for a pool built without
    /// a collector.
    pub(crate) fn set_recording(&self, enabled: bool) {
        self.shared.record_metrics.store(enabled, Ordering::Relaxed);
    }

    pub fn config(&self) -> PoolConfig {
        *self.config.read()
    }

    /// Replace the sizing; only allowed while stopped.
    pub fn reconfigure(&self, config: PoolConfig) -> Result<()> {
        let _workers = self.workers.lock();
        let state = self.shared.state.load();
        if state != EngineState::Stopped {
            return Err(NexusError::ConfigLocked(state));
        }
        validate(&config)?;
        self.shared
            .queue_capacity
            .store(config.queue_capacity, Ordering::Relaxed);
        *self.config.write() = config;
        debug!(threads = config.num_threads, "Worker pool reconfigured");
        Ok(())
    }

    /// Current load as seen by the scaling policy.
    pub fn load(&self) -> LoadSnapshot {
        LoadSnapshot {
            queue_depth: self.queue_depth(),
            workers: self
                .active_threads()
                .saturating_sub(self.shared.retire_requests.load(Ordering::Acquire)),
            idle_workers: self.idle_threads(),
        }
    }

    /// Apply one auto-scaling step within `[min_threads, max_threads]`.
    ///
    /// Only acts while running.  Shrinking is cooperative: surplus workers
    /// retire the next time they find the queue empty.
    pub fn rebalance(&self) -> ScaleDecision {
        let mut workers = self.workers.lock();
        let (finished, alive): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|handle| handle.is_finished());
        *workers = alive;
        for handle in finished {
            join_logged(handle);
        }

        if self.shared.state.load() != EngineState::Running {
            return ScaleDecision::Hold;
        }

        let config = *self.config.read();
        let load = self.load();
        let decision = ScalingPolicy::new(config.min_threads, config.max_threads).evaluate(&load);
        match decision {
            ScaleDecision::Grow(count) => {
                for _ in 0..count {
                    if let Err(err) = self.spawn_worker(&mut workers) {
                        warn!(error = %err, "Failed to grow worker pool");
                        break;
                    }
                }
            }
            ScaleDecision::Shrink(count) => {
                self.shared
                    .retire_requests
                    .fetch_add(count, Ordering::AcqRel);
                self.shared.wake_workers();
            }
            ScaleDecision::Hold => {}
        }
        if decision != ScaleDecision::Hold {
            info!(?decision, queue_depth = load.queue_depth, workers = load.workers, "Rebalanced worker pool");
        }
        decision
    }

    fn spawn_worker(&self, workers: &mut Vec<JoinHandle<()>>) -> Result<()> {
        let worker_id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        self.shared.live_workers.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("nexus-worker-{worker_id}"))
            .spawn(move || worker_loop(shared, worker_id));
        match spawned {
            Ok(handle) => {
                workers.push(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                Err(NexusError::Spawn(err))
            }
        }
    }

    fn join_workers(&self, workers: &mut Vec<JoinHandle<()>>) {
        self.shared.wake_workers();
        for handle in workers.drain(..) {
            join_logged(handle);
        }
        self.shared.retire_requests.store(0, Ordering::Release);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_logged(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("Worker thread panicked");
    }
}

fn validate(config: &PoolConfig) -> Result<()> {
    if config.num_threads == 0 {
        return Err(NexusError::InvalidConfig(
            "worker pool needs at least one thread".into(),
        ));
    }
    if config.min_threads > config.num_threads || config.num_threads > config.max_threads {
        return Err(NexusError::InvalidConfig(format!(
            "thread bounds must satisfy min <= num <= max, got {} <= {} <= {}",
            config.min_threads, config.num_threads, config.max_threads
        )));
    }
    if config.queue_capacity < 2 || !config.queue_capacity.is_power_of_two() {
        return Err(NexusError::InvalidConfig(format!(
            "queue_capacity must be a power of two >= 2, got {}",
            config.queue_capacity
        )));
    }
    if config.batch_size == 0 {
        return Err(NexusError::InvalidConfig(
            "batch_size must be non-zero".into(),
        ));
    }
    Ok(())
}
