//! Nexus Core - In-Process Execution Engine
//!
//! A priority worker pool behind a small lifecycle state machine, with the
//! pieces a latency-sensitive host needs around it:
//!
//! - [`Engine`]: start/stop/pause/resume, task submission, config at rest
//! - [`WorkerPool`]: three priority tiers, future-style [`TaskHandle`]s
//! - [`LockFreeQueue`]: single-producer/single-consumer ring buffer
//! - [`MemoryPool`]: fixed-size blocks with double-free detection
//! - [`MetricsCollector`]: latency percentiles, error rate, throughput
//!
//! # Performance-First Design Patterns:
//! - Lock-free data structures on the producer/consumer path
//! - Atomic counters with acquire/release pairing, no locks across task execution
//! - Long-lived OS threads; nothing is spawned per task

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;

pub use config::EngineConfig;
pub use engine::{
    BlockId, Consumer, Engine, EngineState, LockFreeQueue, MemoryPool, PoolBlock, PoolStats,
    Producer, RingBuffer,
};
pub use error::{NexusError, Result, TaskError};
pub use executor::{
    PoolConfig, Priority, ScaleDecision, ScalingPolicy, TaskHandle, TaskStats, WorkerPool,
};
pub use metrics::{AggregatedMetrics, LatencyPercentiles, MetricsCollector, OperationTimer};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`.  Later calls are no-ops, so
/// tests and embedding hosts can call it freely.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
