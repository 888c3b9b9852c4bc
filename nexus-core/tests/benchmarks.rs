//! Performance benchmarks for Nexus Core.
//!
//! These tests measure timing for the hot paths and check that they stay
//! within generous bounds. Run with:
//!
//! ```sh
//! cargo test -p nexus-core --test benchmarks -- --ignored --nocapture
//! ```

use std::thread;
use std::time::{Duration, Instant};

use nexus_core::{Engine, EngineConfig, LockFreeQueue, MemoryPool, MetricsCollector, Priority};

// ---------------------------------------------------------------------------
// SPSC queue benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_spsc_queue_throughput() {
    const ITEMS: u64 = 1_000_000;
    let (mut producer, mut consumer) = LockFreeQueue::new(4096).unwrap().split();

    let start = Instant::now();
    let feeder = thread::spawn(move || {
        for i in 0..ITEMS {
            let mut item = i;
            while let Err(back) = producer.enqueue(item) {
                item = back;
                std::hint::spin_loop();
            }
        }
    });

    let mut received = 0u64;
    while received < ITEMS {
        match consumer.dequeue() {
            Some(item) => {
                assert_eq!(item, received);
                received += 1;
            }
            None => std::hint::spin_loop(),
        }
    }
    feeder.join().unwrap();
    let elapsed = start.elapsed();
    let per_item = elapsed / ITEMS as u32;

    eprintln!("[bench_spsc_queue] {ITEMS} items in {elapsed:?} ({per_item:?}/item)");
    assert!(
        elapsed.as_secs() < 5,
        "1M SPSC transfers should finish in < 5 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Memory pool benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_memory_pool_cycles() {
    const ITERATIONS: usize = 100_000;
    let pool = MemoryPool::new(4096, 64).unwrap();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let mut block = pool.allocate().unwrap();
        block[0] = i as u8;
        drop(block);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    let stats = pool.stats();
    eprintln!(
        "[bench_memory_pool] {ITERATIONS} allocate+release cycles in {elapsed:?} ({per_iter:?}/iter)"
    );
    eprintln!(
        "  total_allocations={}, total_deallocations={}, free={}",
        stats.total_allocations, stats.total_deallocations, stats.free_blocks
    );
    assert_eq!(stats.total_allocations, ITERATIONS as u64);
    assert_eq!(stats.free_blocks, 64);
    assert!(
        elapsed.as_secs() < 2,
        "100k block cycles should finish in < 2 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Metrics benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_metrics_record_and_aggregate() {
    const OPERATIONS: u64 = 200_000;
    let metrics = MetricsCollector::new();

    let start = Instant::now();
    for i in 0..OPERATIONS {
        metrics.record_operation_us(i % 1000, i % 50 != 0);
    }
    let record_elapsed = start.elapsed();

    let start_agg = Instant::now();
    let agg = metrics.get_aggregated();
    let agg_elapsed = start_agg.elapsed();

    eprintln!(
        "[bench_metrics_record] {OPERATIONS} records in {record_elapsed:?} ({:?}/op)",
        record_elapsed / OPERATIONS as u32
    );
    eprintln!(
        "[bench_metrics_aggregate] {} samples aggregated in {agg_elapsed:?}",
        agg.sample_count
    );
    assert_eq!(agg.total_operations, OPERATIONS);
    assert!(
        agg_elapsed.as_millis() < 500,
        "aggregating a full sample window should take < 500 ms, got {agg_elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Engine benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_engine_task_throughput() {
    const TASKS: usize = 100_000;
    let engine = Engine::new(EngineConfig {
        queue_capacity: 131_072,
        ..EngineConfig::with_threads(4)
    })
    .unwrap();
    engine.start().unwrap();

    let start = Instant::now();
    let handles = engine
        .submit_batch(Priority::Normal, (0..TASKS as u64).map(|i| move || i ^ 0x5a5a))
        .unwrap();
    assert_eq!(handles.len(), TASKS);
    engine.wait_all();
    let elapsed = start.elapsed();
    let per_task = elapsed / TASKS as u32;

    let snapshot = engine.metrics_snapshot();
    eprintln!("[bench_engine_tasks] {TASKS} tasks in {elapsed:?} ({per_task:?}/task)");
    eprintln!(
        "  p50={}us p99={}us throughput={:.0} ops/s",
        snapshot.latency_us.p50, snapshot.latency_us.p99, snapshot.throughput_ops_sec
    );
    assert!(
        elapsed < Duration::from_secs(10),
        "100k trivial tasks should finish in < 10 s, got {elapsed:?}"
    );
    engine.stop();
}
