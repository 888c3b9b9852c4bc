//! Latency and Throughput Metrics
//!
//! Thread-safe accumulation of operation counts, latency extrema, a bounded
//! window of latency samples for percentile estimation, and point-in-time
//! gauges (queue depth, CPU estimate, memory bytes, active threads).
//!
//! # Design Goals:
//! - Lock-free atomic counters on the recording path
//! - Min/max maintained with explicit compare-and-swap retry loops
//! - Sample window capped by a ring buffer; the oldest sample is evicted
//!   once the window is full, so memory stays bounded under sustained load
//!
//! Aggregates are cumulative since construction or the last [`reset`];
//! there is no sliding window over the counters themselves.
//!
//! [`reset`]: MetricsCollector::reset

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::engine::ring_buffer::RingBuffer;
use crate::error::{NexusError, Result};

/// Default number of latency samples retained for percentiles.
pub const DEFAULT_MAX_SAMPLES: usize = 65_535;

/// Latency distribution in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    /// Maximum retained sample.
    pub p999: u64,
    pub mean: f64,
    pub min: u64,
    pub max: u64,
}

/// Point-in-time snapshot produced by [`MetricsCollector::get_aggregated`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    pub latency_us: LatencyPercentiles,
    pub throughput_ops_sec: f64,
    pub total_operations: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub queue_size: usize,
    pub cpu_usage_percent: f64,
    pub memory_bytes: u64,
    pub active_threads: usize,
    pub uptime_seconds: f64,
    /// Samples currently in the percentile window.
    pub sample_count: usize,
}

impl AggregatedMetrics {
    /// Print a human-readable metrics report.
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║             Nexus Engine Metrics Report                   ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Operations                                                ║");
        println!("║   Total:       {:>10}   Errors: {:>10}           ║",
                 self.total_operations, self.total_errors);
        println!("║   Error rate:  {:>9.4}%   Throughput: {:>10.1} ops/s ║",
                 self.error_rate * 100.0, self.throughput_ops_sec);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Latency (us)                                              ║");
        println!("║   p50: {:>10}  p95: {:>10}  p99: {:>10}        ║",
                 self.latency_us.p50, self.latency_us.p95, self.latency_us.p99);
        println!("║   p99.9: {:>8}  min: {:>10}  max: {:>10}        ║",
                 self.latency_us.p999, self.latency_us.min, self.latency_us.max);
        println!("║   mean: {:>12.2}                                      ║",
                 self.latency_us.mean);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Gauges                                                    ║");
        println!("║   Queue depth: {:>8}   Active threads: {:>6}            ║",
                 self.queue_size, self.active_threads);
        println!("║   CPU: {:>7.2}%   Memory: {:>12} bytes               ║",
                 self.cpu_usage_percent, self.memory_bytes);
        println!("║   Uptime: {:>10.3} s                                     ║",
                 self.uptime_seconds);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// Replace `cell` with `candidate` while `replaces(candidate, current)` holds.
///
/// Read the current extremum, attempt the swap, and retry with the freshly
/// observed value on contention.  No update is lost: a competing writer
/// either lands first (and is then compared against) or loses its own swap.
fn update_extremum(cell: &AtomicU64, candidate: u64, replaces: impl Fn(u64, u64) -> bool) {
    let mut current = cell.load(Ordering::Acquire);
    while replaces(candidate, current) {
        match cell.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Thread-safe metrics sink shared by the engine and its workers.
pub struct MetricsCollector {
    total_operations: AtomicU64,
    total_errors: AtomicU64,
    latency_sum_us: AtomicU64,
    min_latency_us: AtomicU64,
    max_latency_us: AtomicU64,

    queue_size: AtomicUsize,
    cpu_usage_bits: AtomicU64,
    memory_bytes: AtomicU64,
    active_threads: AtomicUsize,

    samples: Mutex<RingBuffer<u64>>,
    max_samples: usize,
    started_at: Mutex<Instant>,
}

impl MetricsCollector {
    /// Create a collector retaining [`DEFAULT_MAX_SAMPLES`] samples.
    pub fn new() -> Self {
        Self::with_max_samples(DEFAULT_MAX_SAMPLES)
            .expect("default sample window is a valid ring capacity")
    }

    /// Create a collector retaining at most `max_samples` latency samples.
    pub fn with_max_samples(max_samples: usize) -> Result<Self> {
        if max_samples == 0 {
            return Err(NexusError::InvalidConfig(
                "metrics sample window must be non-zero".into(),
            ));
        }
        // One ring slot is reserved, so round `max_samples + 1` up.
        let window = RingBuffer::new((max_samples + 1).next_power_of_two())?;
        Ok(Self {
            total_operations: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
            queue_size: AtomicUsize::new(0),
            cpu_usage_bits: AtomicU64::new(0f64.to_bits()),
            memory_bytes: AtomicU64::new(0),
            active_threads: AtomicUsize::new(0),
            samples: Mutex::new(window),
            max_samples,
            started_at: Mutex::new(Instant::now()),
        })
    }

    /// Record one completed operation.
    pub fn record_operation(&self, latency: Duration, success: bool) {
        self.record_operation_us(latency.as_micros() as u64, success);
    }

    /// Record one completed operation with a latency in microseconds.
    pub fn record_operation_us(&self, latency_us: u64, success: bool) {
        self.total_operations.fetch_add(1, Ordering::Release);
        if !success {
            self.total_errors.fetch_add(1, Ordering::Release);
        }
        self.latency_sum_us.fetch_add(latency_us, Ordering::Release);

        update_extremum(&self.min_latency_us, latency_us, |new, cur| new < cur);
        update_extremum(&self.max_latency_us, latency_us, |new, cur| new > cur);

        let mut samples = self.samples.lock();
        if samples.size() >= self.max_samples {
            samples.pop_front();
        }
        // Cannot fail: the window always has a free slot after eviction.
        let _ = samples.push_back(latency_us);
    }

    pub fn record_queue_size(&self, size: usize) {
        self.queue_size.store(size, Ordering::Release);
    }

    pub fn record_cpu_usage(&self, percent: f64) {
        self.cpu_usage_bits.store(percent.to_bits(), Ordering::Release);
    }

    pub fn record_memory_usage(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Release);
    }

    pub fn record_active_threads(&self, threads: usize) {
        self.active_threads.store(threads, Ordering::Release);
    }

    /// Compute a snapshot of everything recorded since the last reset.
    pub fn get_aggregated(&self) -> AggregatedMetrics {
        let total_operations = self.total_operations.load(Ordering::Acquire);
        let total_errors = self.total_errors.load(Ordering::Acquire);
        let uptime_seconds = self.started_at.lock().elapsed().as_secs_f64();

        let error_rate = if total_operations > 0 {
            total_errors as f64 / total_operations as f64
        } else {
            0.0
        };
        let throughput_ops_sec = if uptime_seconds > 0.0 {
            total_operations as f64 / uptime_seconds
        } else {
            0.0
        };

        let (mut latency_us, sample_count) = self.calculate_percentiles();
        if total_operations > 0 {
            latency_us.mean =
                self.latency_sum_us.load(Ordering::Acquire) as f64 / total_operations as f64;
            latency_us.min = self.min_latency_us.load(Ordering::Acquire);
            latency_us.max = self.max_latency_us.load(Ordering::Acquire);
        }

        AggregatedMetrics {
            latency_us,
            throughput_ops_sec,
            total_operations,
            total_errors,
            error_rate,
            queue_size: self.queue_size.load(Ordering::Acquire),
            cpu_usage_percent: f64::from_bits(self.cpu_usage_bits.load(Ordering::Acquire)),
            memory_bytes: self.memory_bytes.load(Ordering::Acquire),
            active_threads: self.active_threads.load(Ordering::Acquire),
            uptime_seconds,
            sample_count,
        }
    }

    /// Sort the retained samples and index at `floor(len * fraction)`.
    fn calculate_percentiles(&self) -> (LatencyPercentiles, usize) {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return (LatencyPercentiles::default(), 0);
        }
        sorted.sort_unstable();

        let len = sorted.len();
        let at = |fraction: f64| sorted[((len as f64 * fraction) as usize).min(len - 1)];
        let percentiles = LatencyPercentiles {
            p50: sorted[len / 2],
            p95: at(0.95),
            p99: at(0.99),
            p999: sorted[len - 1],
            ..LatencyPercentiles::default()
        };
        (percentiles, len)
    }

    /// Zero all counters, clear samples, and restart the uptime clock.
    pub fn reset(&self) {
        self.total_operations.store(0, Ordering::Release);
        self.total_errors.store(0, Ordering::Release);
        self.latency_sum_us.store(0, Ordering::Release);
        self.min_latency_us.store(u64::MAX, Ordering::Release);
        self.max_latency_us.store(0, Ordering::Release);
        self.samples.lock().clear();
        *self.started_at.lock() = Instant::now();
    }

    /// JSON rendering of [`get_aggregated`](Self::get_aggregated).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.get_aggregated())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Records an operation into a [`MetricsCollector`] when finished or dropped.
///
/// A timer dropped without [`finish`](Self::finish) counts as a failure,
/// which covers early returns and unwinding.
pub struct OperationTimer<'a> {
    start: Instant,
    metrics: &'a MetricsCollector,
    finished: bool,
}

impl<'a> OperationTimer<'a> {
    /// Start timing now.
    pub fn new(metrics: &'a MetricsCollector) -> Self {
        Self::since(metrics, Instant::now())
    }

    /// Time from an earlier instant, e.g. when a task was submitted.
    pub fn since(metrics: &'a MetricsCollector, start: Instant) -> Self {
        Self {
            start,
            metrics,
            finished: false,
        }
    }

    /// Record the elapsed time with the given outcome.
    pub fn finish(mut self, success: bool) -> Duration {
        self.finished = true;
        let elapsed = self.start.elapsed();
        self.metrics.record_operation(elapsed, success);
        elapsed
    }
}

impl Drop for OperationTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record_operation(self.start.elapsed(), false);
        }
    }
}
