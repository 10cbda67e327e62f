//! Integration tests for pull cycles.
//!
//! Covers the orchestrator's ordering and single-flight behavior and the
//! scheduler driving it, using the scripted mock driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pull_exporter::backend::{
    ImageBackend, MockCall, MockDriver, MockPull, PullOutcome, PullPipeline, PullStatus,
};
use pull_exporter::config::{FleetConfig, ImageSpec};
use pull_exporter::metrics::{MetricEvent, MetricsLog};
use pull_exporter::orchestrator::{CycleOutcome, Orchestrator};
use pull_exporter::scheduler::{Scheduler, Trigger};
use tokio::sync::{watch, Notify};

fn fleet(images: &[&str]) -> Arc<FleetConfig> {
    Arc::new(FleetConfig {
        location: "lab".to_string(),
        image_downloads: images
            .iter()
            .map(|image| ImageSpec::new(*image, "test"))
            .collect(),
        ..Default::default()
    })
}

fn mock_orchestrator(images: &[&str], driver: MockDriver) -> (Arc<Orchestrator>, Arc<MetricsLog>) {
    let log = Arc::new(MetricsLog::new());
    let backend = Arc::new(PullPipeline::new(driver, log.clone()));
    (Arc::new(Orchestrator::new(fleet(images), backend)), log)
}

/// Backend that parks inside the first pull until released.
#[derive(Default)]
struct BlockingBackend {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl ImageBackend for BlockingBackend {
    async fn pull_and_delete(&self, _spec: &ImageSpec, _location: &str) -> PullOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        PullOutcome {
            status: PullStatus::Succeeded,
            elapsed: Duration::ZERO,
            bytes: 0,
            last_speed: None,
            reason: None,
        }
    }
}

#[tokio::test]
async fn test_empty_fleet_completes_immediately() {
    let driver = MockDriver::new();
    let (orchestrator, log) = mock_orchestrator(&[], driver.clone());

    let outcome = orchestrator.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            succeeded: 0,
            failed: 0
        }
    );
    assert!(log.is_empty());
    assert!(driver.calls().is_empty());
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test]
async fn test_failure_does_not_stop_the_cycle() {
    let driver = MockDriver::new()
        .script("alpnie:latest", MockPull::Rejected("pull access denied for alpnie".into()))
        .script("alpine:latest", MockPull::Chunks(vec![2048]));
    let (orchestrator, log) = mock_orchestrator(&["alpnie:latest", "alpine:latest"], driver.clone());

    let outcome = orchestrator.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 1
        }
    );

    let outcomes: Vec<_> = log
        .events()
        .into_iter()
        .filter(|e| e.is_pull_outcome())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            MetricEvent::PullFailure {
                image: "alpnie:latest".into(),
                reason: "pull access denied for alpnie".into(),
            },
            MetricEvent::PullSuccess {
                image: "alpine:latest".into()
            },
        ]
    );

    // Each image gets its own session; only the pulled one is deleted.
    assert_eq!(
        driver.calls(),
        vec![
            MockCall::Connect,
            MockCall::Pull("alpnie:latest".into()),
            MockCall::Connect,
            MockCall::Pull("alpine:latest".into()),
            MockCall::Remove("alpine:latest".into()),
        ]
    );
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test]
async fn test_unreachable_runtime_fails_every_image() {
    let driver = MockDriver::unreachable("Cannot connect to the Docker daemon");
    let (orchestrator, log) = mock_orchestrator(&["a", "b", "c"], driver);

    let outcome = orchestrator.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            succeeded: 0,
            failed: 3
        }
    );
    assert_eq!(log.len(), 3);
    assert!(log
        .events()
        .iter()
        .all(|e| matches!(e, MetricEvent::PullFailure { reason, .. } if reason == "Cannot connect to the Docker daemon")));

    // The guard is released after an all-failure cycle.
    assert!(!orchestrator.is_in_flight());
    assert_ne!(orchestrator.run_cycle().await, CycleOutcome::Skipped);
}

#[tokio::test]
async fn test_overlapping_trigger_is_skipped() {
    let backend = Arc::new(BlockingBackend::default());
    let orchestrator = Arc::new(Orchestrator::new(fleet(&["alpine"]), backend.clone()));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run_cycle().await }
    });
    backend.entered.notified().await;
    assert!(orchestrator.is_in_flight());

    assert_eq!(orchestrator.run_cycle().await, CycleOutcome::Skipped);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    backend.release.notify_one();
    assert_eq!(
        first.await.unwrap(),
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert!(!orchestrator.is_in_flight());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_run_one_cycle() {
    let backend = Arc::new(BlockingBackend::default());
    let orchestrator = Arc::new(Orchestrator::new(fleet(&["alpine"]), backend.clone()));

    let first = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run_cycle().await }
    });
    backend.entered.notified().await;

    let others: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run_cycle().await })
        })
        .collect();
    for handle in others {
        assert_eq!(handle.await.unwrap(), CycleOutcome::Skipped);
    }

    backend.release.notify_one();
    assert!(matches!(first.await.unwrap(), CycleOutcome::Completed { .. }));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_fires_after_one_period() {
    let driver = MockDriver::new().script("alpine", MockPull::Chunks(vec![64]));
    let (orchestrator, log) = mock_orchestrator(&["alpine"], driver.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(orchestrator, Trigger::Every(Duration::from_secs(60)));
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(driver.calls().is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..10 {
        if !log.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        log.events()
            .into_iter()
            .filter(|e| e.is_pull_outcome())
            .collect::<Vec<_>>(),
        vec![MetricEvent::PullSuccess {
            image: "alpine".into()
        }]
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_stops_when_sender_dropped() {
    let (orchestrator, _log) = mock_orchestrator(&[], MockDriver::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(orchestrator, Trigger::Every(Duration::from_secs(60)));
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}
