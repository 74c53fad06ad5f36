//! Supervisor behavior: crash isolation, drain timeouts and restarts

use eventbus_service::supervisor::{
    SupervisorError, TaskSupervisor, Worker, WorkerError, WorkerFn, WorkerOptions, WorkerState,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn cooperative() -> Arc<dyn Worker> {
    WorkerFn::arc(|cancel: CancellationToken| async move {
        cancel.cancelled().await;
        Ok::<(), WorkerError>(())
    })
}

/// Ignores cancellation entirely
fn stubborn() -> Arc<dyn Worker> {
    WorkerFn::arc(|_cancel: CancellationToken| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), WorkerError>(())
    })
}

async fn wait_for(supervisor: &TaskSupervisor, name: &str, expected: WorkerState) {
    let mut rx = supervisor.watch(name).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == expected))
        .await
        .unwrap_or_else(|_| panic!("{name} never reached {expected}"))
        .unwrap();
}

#[tokio::test]
async fn test_stubborn_worker_hits_drain_timeout() {
    let supervisor = TaskSupervisor::new();
    supervisor
        .register("stubborn", stubborn(), WorkerOptions::default())
        .await
        .unwrap();
    supervisor.start("stubborn").await.unwrap();

    let result = supervisor.stop("stubborn", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(SupervisorError::DrainTimeout { .. })));

    let status = supervisor.status("stubborn").await.unwrap();
    assert_eq!(status.state, WorkerState::Failed);
    assert!(status.last_error.unwrap().contains("did not stop"));
}

#[tokio::test]
async fn test_stop_all_drains_concurrently() {
    let supervisor = TaskSupervisor::new();
    for name in ["a", "b"] {
        supervisor
            .register(name, cooperative(), WorkerOptions::default())
            .await
            .unwrap();
    }
    for name in ["slow-1", "slow-2"] {
        supervisor
            .register(name, stubborn(), WorkerOptions::default())
            .await
            .unwrap();
    }

    let started = supervisor.start_all().await;
    assert_eq!(started.len(), 4);

    let begin = Instant::now();
    let report = supervisor.stop_all(Duration::from_millis(200)).await;

    // Two stubborn workers waited on in parallel, not one after the other
    assert!(begin.elapsed() < Duration::from_millis(390));
    assert_eq!(report.stopped, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(report.timed_out, vec!["slow-1".to_string(), "slow-2".to_string()]);
    assert!(!report.is_clean());

    for name in ["a", "b"] {
        assert_eq!(supervisor.status(name).await.unwrap().state, WorkerState::Stopped);
    }
}

#[tokio::test]
async fn test_failure_does_not_affect_siblings() {
    let supervisor = TaskSupervisor::new();
    supervisor
        .register("steady", cooperative(), WorkerOptions::default())
        .await
        .unwrap();
    supervisor
        .register(
            "broken",
            WorkerFn::arc(|_cancel: CancellationToken| async {
                Err::<(), _>(WorkerError::failed("sensor unreachable"))
            }),
            WorkerOptions::default(),
        )
        .await
        .unwrap();

    supervisor.start_all().await;
    wait_for(&supervisor, "broken", WorkerState::Failed).await;

    let broken = supervisor.status("broken").await.unwrap();
    assert_eq!(broken.last_error.as_deref(), Some("sensor unreachable"));
    assert_eq!(broken.runs, 1);
    assert_eq!(
        supervisor.status("steady").await.unwrap().state,
        WorkerState::Running
    );

    let report = supervisor.stop_all(Duration::from_secs(1)).await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_sibling_keeps_ticking_after_mid_run_failure() {
    let supervisor = TaskSupervisor::new();

    let iterations = Arc::new(AtomicU64::new(0));
    let counted = iterations.clone();
    supervisor
        .register(
            "flaky",
            WorkerFn::arc(move |cancel: CancellationToken| {
                let counted = counted.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err::<(), _>(WorkerError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                        }
                        if counted.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                            return Err(WorkerError::failed("third reading rejected"));
                        }
                    }
                }
            }),
            WorkerOptions::default(),
        )
        .await
        .unwrap();

    let ticks = Arc::new(AtomicU64::new(0));
    let ticking = ticks.clone();
    supervisor
        .register(
            "ticker",
            WorkerFn::arc(move |cancel: CancellationToken| {
                let ticking = ticking.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok::<(), WorkerError>(()),
                            _ = tokio::time::sleep(Duration::from_millis(5)) => {
                                ticking.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }),
            WorkerOptions::default(),
        )
        .await
        .unwrap();

    supervisor.start_all().await;
    wait_for(&supervisor, "flaky", WorkerState::Failed).await;

    let flaky = supervisor.status("flaky").await.unwrap();
    assert_eq!(flaky.runs, 1);
    assert_eq!(flaky.last_error.as_deref(), Some("third reading rejected"));
    assert_eq!(iterations.load(Ordering::SeqCst), 3);

    let after_failure = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ticks.load(Ordering::SeqCst) > after_failure);
    assert_eq!(
        supervisor.status("ticker").await.unwrap().state,
        WorkerState::Running
    );

    // No automatic restart of the failed worker
    assert_eq!(iterations.load(Ordering::SeqCst), 3);
    assert_eq!(supervisor.status("flaky").await.unwrap().runs, 1);

    let report = supervisor.stop_all(Duration::from_secs(1)).await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_stopped_worker_can_start_again() {
    let supervisor = TaskSupervisor::new();
    supervisor
        .register("worker", cooperative(), WorkerOptions::default())
        .await
        .unwrap();

    supervisor.start("worker").await.unwrap();
    supervisor.stop("worker", Duration::from_secs(1)).await.unwrap();
    assert_eq!(supervisor.status("worker").await.unwrap().state, WorkerState::Stopped);

    supervisor.start("worker").await.unwrap();
    wait_for(&supervisor, "worker", WorkerState::Running).await;
    assert_eq!(supervisor.status("worker").await.unwrap().runs, 2);

    supervisor.stop("worker", Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_stop_of_idle_worker_is_noop() {
    let supervisor = TaskSupervisor::new();
    supervisor
        .register("idle", cooperative(), WorkerOptions::manual())
        .await
        .unwrap();

    assert!(supervisor.start_all().await.is_empty());
    supervisor.stop("idle", Duration::from_millis(10)).await.unwrap();
    assert_eq!(supervisor.status("idle").await.unwrap().state, WorkerState::Idle);
}
