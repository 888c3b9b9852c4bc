//! End-to-end behavior of the engine: lifecycle, scheduling order, failure
//! capture and the producer/consumer path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use nexus_core::{
    Engine, EngineConfig, EngineState, LockFreeQueue, MetricsCollector, NexusError, Priority,
    TaskError,
};

fn engine(threads: usize) -> Engine {
    nexus_core::init_tracing();
    Engine::new(EngineConfig {
        block_size: 256,
        block_count: 8,
        ..EngineConfig::with_threads(threads)
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn start_then_stop_joins_all_workers() {
    let engine = engine(4);
    engine.start().unwrap();
    assert_eq!(engine.active_threads(), 4);
    assert_eq!(engine.metrics_snapshot().active_threads, 4);

    assert!(engine.stop());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.active_threads(), 0);
    assert_eq!(engine.metrics_snapshot().active_threads, 0);
}

#[test]
fn stop_from_paused() {
    let engine = engine(2);
    engine.start().unwrap();
    assert!(engine.pause());
    assert!(engine.stop());
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.active_threads(), 0);
}

#[test]
fn stop_returns_while_another_thread_toggles_pause() {
    for _ in 0..20 {
        let engine = Arc::new(engine(2));
        engine.start().unwrap();

        let toggling = Arc::new(AtomicBool::new(true));
        let toggler = {
            let engine = Arc::clone(&engine);
            let toggling = Arc::clone(&toggling);
            thread::spawn(move || {
                while toggling.load(Ordering::Acquire) {
                    engine.pause();
                    engine.resume();
                }
            })
        };

        thread::sleep(std::time::Duration::from_micros(200));
        assert!(engine.stop());
        toggling.store(false, Ordering::Release);
        toggler.join().unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.active_threads(), 0);
    }
}

#[test]
fn concurrent_start_has_one_winner() {
    let engine = Arc::new(engine(2));
    let winners: usize = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.start().unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    assert_eq!(winners, 1);
    assert_eq!(engine.active_threads(), 2);
    engine.stop();
}

#[test]
fn dropping_running_engine_joins_workers() {
    let counter = Arc::new(AtomicU64::new(0));
    {
        let engine = engine(3);
        engine.start().unwrap();
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            engine
                .submit(move || counter.fetch_add(1, Ordering::SeqCst))
                .unwrap();
        }
        engine.wait_all();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 50);
}

#[test]
fn config_is_frozen_while_active() {
    let engine = engine(1);
    engine.start().unwrap();
    engine.pause();
    assert!(matches!(
        engine.set_config(EngineConfig::with_threads(2)),
        Err(NexusError::ConfigLocked(EngineState::Paused))
    ));
    engine.stop();
    assert!(engine.set_config(EngineConfig::with_threads(2)).is_ok());
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[test]
fn high_runs_before_normal_before_low() {
    let engine = engine(1);
    engine.start().unwrap();
    engine.pause();

    let order = Arc::new(Mutex::new(Vec::new()));
    for (label, priority) in [
        ("low", Priority::Low),
        ("high-a", Priority::High),
        ("normal", Priority::Normal),
        ("high-b", Priority::High),
    ] {
        let order = Arc::clone(&order);
        engine
            .submit_with_priority(priority, move || order.lock().unwrap().push(label))
            .unwrap();
    }

    engine.resume();
    engine.wait_all();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["high-a", "high-b", "normal", "low"]
    );
}

#[test]
fn paused_engine_queues_but_does_not_run() {
    let engine = engine(2);
    engine.start().unwrap();
    engine.pause();

    let (tx, rx) = mpsc::channel();
    engine.submit(move || tx.send(()).unwrap()).unwrap();
    assert!(rx
        .recv_timeout(std::time::Duration::from_millis(100))
        .is_err());
    assert_eq!(engine.queue_depth(), 1);

    engine.resume();
    assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn panicking_task_does_not_kill_worker() {
    let engine = engine(1);
    engine.start().unwrap();

    let bad = engine.submit(|| -> u8 { panic!("payload failure") }).unwrap();
    let good = engine.submit(|| 9u8).unwrap();

    assert_eq!(
        bad.wait(),
        Err(TaskError::Panicked("payload failure".into()))
    );
    assert_eq!(good.wait(), Ok(9));
    engine.wait_all();

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.total_operations, 2);
    assert_eq!(snapshot.total_errors, 1);
    assert!((snapshot.error_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(engine.active_threads(), 1);
}

#[test]
fn submissions_rejected_when_stopped() {
    let engine = engine(1);
    assert!(matches!(
        engine.submit(|| ()),
        Err(NexusError::NotAccepting(EngineState::Stopped))
    ));
}

// ---------------------------------------------------------------------------
// Data paths
// ---------------------------------------------------------------------------

#[test]
fn spsc_queue_feeds_engine_in_order() {
    const ITEMS: u64 = 5_000;
    let engine = engine(4);
    engine.start().unwrap();

    let (mut producer, mut consumer) = LockFreeQueue::new(64).unwrap().split();
    let feeder = thread::spawn(move || {
        for i in 0..ITEMS {
            let mut item = i;
            while let Err(back) = producer.enqueue(item) {
                item = back;
                thread::yield_now();
            }
        }
    });

    let sum = Arc::new(AtomicU64::new(0));
    let mut expected = 0;
    loop {
        match consumer.dequeue() {
            Some(item) => {
                assert_eq!(item, expected);
                expected += 1;
                let sum = Arc::clone(&sum);
                engine
                    .submit(move || sum.fetch_add(item, Ordering::Relaxed))
                    .unwrap();
            }
            None if consumer.is_abandoned() => break,
            None => thread::yield_now(),
        }
    }
    feeder.join().unwrap();
    engine.wait_all();

    assert_eq!(expected, ITEMS);
    assert_eq!(sum.load(Ordering::Relaxed), ITEMS * (ITEMS - 1) / 2);
    assert_eq!(engine.task_stats().completed_tasks, ITEMS);
}

#[test]
fn many_submitters_wait_all() {
    let engine = Arc::new(engine(4));
    engine.start().unwrap();

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..250u64 {
                    engine.submit(move || i * 2).unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    engine.wait_all();

    let stats = engine.task_stats();
    assert_eq!(stats.total_tasks, 1000);
    assert_eq!(stats.completed_tasks, 1000);
    engine.stop();
}

#[test]
fn shared_collector_across_engines() {
    let metrics = Arc::new(MetricsCollector::new());
    let a = Engine::with_metrics(EngineConfig::with_threads(1), Arc::clone(&metrics)).unwrap();
    let b = Engine::with_metrics(EngineConfig::with_threads(1), Arc::clone(&metrics)).unwrap();
    a.start().unwrap();
    b.start().unwrap();
    a.submit(|| ()).unwrap();
    b.submit(|| ()).unwrap();
    a.wait_all();
    b.wait_all();
    assert_eq!(metrics.get_aggregated().total_operations, 2);
}

#[tokio::test]
async fn handles_can_be_awaited() {
    let engine = engine(2);
    engine.start().unwrap();

    let handles: Vec<_> = (1..=10u64)
        .map(|i| engine.submit(move || i * 10).unwrap())
        .collect();
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 550);

    let block_len = engine
        .submit_with_block(Priority::High, |block| block.len())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(block_len, 256);
}
