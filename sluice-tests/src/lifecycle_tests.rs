//! Stage lifecycle, failure handling, and drain tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use sluice_shuffle::{
    ExhaustedWritePolicy, FlushPolicy, LingerFlusher, RetryConfig, ShuffleError, StageState,
};

use crate::scenarios::{Harness, Workload, USER_WINDOW};

#[test]
fn test_lifecycle_reconfigure_creates_topology_once() {
    let harness = Harness::new(Harness::config().with_window(USER_WINDOW)).unwrap();
    assert!(harness.stage.topology_scope().is_none());

    harness.stage.reconfigure().unwrap();
    harness.stage.reconfigure().unwrap();
    assert_eq!(harness.stage.state(), StageState::ConfigResolved);

    harness.stage.start().unwrap();
    harness.stage.reconfigure().unwrap();
    assert_eq!(harness.stage.state(), StageState::Running);
    assert_eq!(harness.creator.creations(), 1);

    let scope = harness.stage.topology_scope().unwrap();
    assert_eq!(scope.split_count, harness.stage.config().split_count);
}

#[test]
fn test_lifecycle_missing_window_marks_unhealthy() {
    let harness = Harness::new(Harness::config().with_window("no_such_window")).unwrap();

    assert!(matches!(
        harness.stage.reconfigure(),
        Err(ShuffleError::WindowNotFound { .. })
    ));
    assert_eq!(harness.stage.state(), StageState::Unhealthy);
    assert!(harness.stage.unhealthy_reason().is_some());
    assert!(matches!(
        harness.stage.start(),
        Err(ShuffleError::Unhealthy { .. })
    ));
    assert!(matches!(
        harness.stage.ingest(Workload::new(1, "q0").batch(1)),
        Err(ShuffleError::Unhealthy { .. })
    ));
}

#[test]
fn test_lifecycle_topology_failure_marks_unhealthy() {
    let harness = Harness::new(Harness::config()).unwrap();
    harness.creator.fail_next_create();

    assert!(matches!(
        harness.stage.reconfigure(),
        Err(ShuffleError::Topology { .. })
    ));
    assert_eq!(harness.stage.state(), StageState::Unhealthy);
    assert_eq!(harness.creator.creations(), 0);
}

#[test]
fn test_lifecycle_ingest_before_start_rejected() {
    let harness = Harness::new(Harness::config()).unwrap();
    harness.stage.reconfigure().unwrap();

    assert!(matches!(
        harness.stage.ingest(Workload::new(1, "q0").batch(3)),
        Err(ShuffleError::NotReady {
            state: StageState::ConfigResolved,
            required: StageState::Running,
        })
    ));
    assert!(!harness.stage.has_notified());
}

#[test]
fn test_lifecycle_shutdown_drains_pending() {
    let config = Harness::config().with_flush(FlushPolicy::default().with_max_records(1_000));
    let harness = Harness::running(config).unwrap();

    harness.stage.ingest(Workload::new(2, "q0").batch(30)).unwrap();
    assert_eq!(harness.stage.pending_records(), 30);
    assert_eq!(harness.delivered_records().unwrap(), 0);

    let report = harness.stage.shutdown();
    assert_eq!(report.delivered_records, 30);
    assert_eq!(harness.stage.state(), StageState::Stopped);
    assert!(harness.producer().is_closed());
    assert_eq!(harness.delivered_records().unwrap(), 30);

    // Idempotent.
    assert_eq!(harness.stage.shutdown().merges, 0);
    assert_eq!(harness.stage.state(), StageState::Stopped);
}

#[test]
fn test_lifecycle_shutdown_keeps_every_accepted_ingest() {
    const THREADS: usize = 6;

    let harness = Harness::running(Harness::config()).unwrap();
    let accepted = AtomicUsize::new(0);
    let stopping = AtomicBool::new(false);
    let barrier = Barrier::new(THREADS + 1);

    std::thread::scope(|s| {
        for thread in 0..THREADS {
            let harness = &harness;
            let accepted = &accepted;
            let stopping = &stopping;
            let barrier = &barrier;
            s.spawn(move || {
                let mut workload = Workload::new(thread as u64, format!("q{thread}"));
                barrier.wait();
                while !stopping.load(Ordering::SeqCst) {
                    match harness.stage.ingest(workload.batch(7)) {
                        Ok(summary) => {
                            accepted.fetch_add(summary.routed, Ordering::SeqCst);
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        barrier.wait();
        std::thread::sleep(Duration::from_millis(20));
        let _ = harness.stage.shutdown();
        stopping.store(true, Ordering::SeqCst);
    });

    assert_eq!(harness.stage.state(), StageState::Stopped);
    assert_eq!(
        harness.delivered_records().unwrap(),
        accepted.load(Ordering::SeqCst)
    );
}

#[test]
fn test_lifecycle_transient_write_failures_retried() {
    let config = Harness::config().with_test_mode(true).with_retry(RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    });
    let harness = Harness::running(config).unwrap();
    harness.producer().inject_transient_failures(2);

    let records = Workload::new(4, "q0").batch(5);
    let mut routed = records.clone();
    routed.retain(|r| !r.is_system_message());
    harness.stage.ingest(records).unwrap();

    let stats = harness.stage.stats().snapshot();
    assert_eq!(stats.write_retries, 2);
    assert_eq!(stats.records_dropped, 0);
    assert_eq!(harness.delivered_records().unwrap(), routed.len());
    assert_eq!(harness.stage.state(), StageState::Running);
}

#[test]
fn test_lifecycle_exhausted_retries_drop_by_default() {
    let harness = Harness::running(Harness::config().with_test_mode(true)).unwrap();
    harness.producer().inject_transient_failures(1_000);

    let summary = harness
        .stage
        .ingest(Workload::new(4, "q0").batch(12))
        .unwrap();

    let stats = harness.stage.stats().snapshot();
    assert_eq!(stats.records_dropped, summary.routed as u64);
    assert_eq!(stats.batches_dropped, summary.partitions as u64);
    assert_eq!(harness.delivered_records().unwrap(), 0);
    assert_eq!(harness.stage.state(), StageState::Running);
}

#[test]
fn test_lifecycle_exhausted_retries_escalate() {
    let config = Harness::config()
        .with_test_mode(true)
        .with_exhausted_write_policy(ExhaustedWritePolicy::Escalate);
    let harness = Harness::running(config).unwrap();
    harness.producer().inject_transient_failures(1_000);

    harness.stage.ingest(Workload::new(4, "q0").batch(12)).unwrap();

    assert_eq!(harness.stage.state(), StageState::Unhealthy);
    assert!(matches!(
        harness.stage.ingest(Workload::new(5, "q1").batch(1)),
        Err(ShuffleError::Unhealthy { .. })
    ));
}

#[test]
fn test_lifecycle_fatal_write_marks_unhealthy() {
    let harness = Harness::running(Harness::config().with_test_mode(true)).unwrap();
    harness.producer().set_fatal(true);

    let summary = harness
        .stage
        .ingest(Workload::new(8, "q0").batch(10))
        .unwrap();

    let stats = harness.stage.stats().snapshot();
    assert_eq!(stats.write_retries, 0);
    assert_eq!(stats.records_dropped, summary.routed as u64);
    assert_eq!(harness.stage.state(), StageState::Unhealthy);
    assert!(harness
        .stage
        .unhealthy_reason()
        .is_some_and(|r| r.contains("producer unavailable")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_linger_flusher_flushes_idle_partitions() {
    let config = Harness::config()
        .with_window(USER_WINDOW)
        .with_flush(
            FlushPolicy::default()
                .with_max_records(1_000)
                .with_max_linger(Duration::from_millis(5)),
        );
    let harness = Harness::running(config).unwrap();
    let flusher = LingerFlusher::spawn(Arc::clone(&harness.stage));

    harness.stage.ingest(Workload::new(9, "q0").batch(15)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.delivered_records().unwrap() < 15 {
        assert!(Instant::now() < deadline, "linger flush did not happen");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.stage.pending_records(), 0);

    flusher.stop().await;
    let report = harness.stage.shutdown();
    assert_eq!(report.delivered_records, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_ingest_returns_while_producer_backs_off() {
    let config = Harness::config()
        .with_flush(
            FlushPolicy::default()
                .with_max_records(1)
                .with_max_linger(Duration::from_secs(60)),
        )
        .with_retry(RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
        });
    let harness = Harness::running(config).unwrap();
    let flusher = LingerFlusher::spawn(Arc::clone(&harness.stage));
    harness.producer().inject_transient_failures(3);

    let mut workload = Workload::new(12, "q0");
    for _ in 0..4 {
        let started = Instant::now();
        harness.stage.ingest(workload.batch(1)).unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "ingest waited {:?} on the producer",
            started.elapsed()
        );
    }

    // The flusher absorbs the backoff and still delivers everything.
    let deadline = Instant::now() + Duration::from_secs(10);
    while harness.delivered_records().unwrap() < 4 {
        assert!(Instant::now() < deadline, "triggered flush did not happen");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = harness.stage.stats().snapshot();
    assert_eq!(stats.write_retries, 3);
    assert_eq!(stats.records_dropped, 0);

    flusher.stop().await;
    assert_eq!(harness.stage.shutdown().delivered_records, 0);
}
