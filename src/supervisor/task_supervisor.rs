//! Supervisor for named long-running workers
//!
//! Each registered worker gets its own slot: the worker factory, its
//! options, a watch channel carrying its [`WorkerStatus`], and the
//! cancellation token plus join handle of the run in flight.
//!
//! ```text
//! Idle/Stopped/Failed --start--> Starting --> Running --ok/stop requested/cancelled--> Stopped
//!                                               |  \--error/panic--> Failed
//!                                               \--stop--> Cancelling --> Stopped | Failed (drain timeout)
//! ```
//!
//! A run that errors or panics only affects its own slot; the supervisor
//! and sibling workers keep going.

use super::worker::{RestartPolicy, Worker, WorkerError, WorkerOptions, WorkerState};
use crate::observability::metrics::metrics;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
    #[error("Worker already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Worker already running: {0}")]
    AlreadyRunning(String),
    #[error("Worker '{name}' did not stop within {timeout:?}")]
    DrainTimeout { name: String, timeout: Duration },
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    /// Error of the most recent failed run
    pub last_error: Option<String>,
    /// Number of runs started, restarts included
    pub runs: u64,
}

/// Result of [`TaskSupervisor::stop_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub timed_out: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty()
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Slot {
    name: String,
    worker: Arc<dyn Worker>,
    options: WorkerOptions,
    status: Arc<watch::Sender<WorkerStatus>>,
    active: Option<ActiveRun>,
}

impl Slot {
    fn state(&self) -> WorkerState {
        self.status.borrow().state
    }
}

/// Runs named workers with uniform start/stop semantics and crash isolation
#[derive(Default)]
pub struct TaskSupervisor {
    slots: Mutex<Vec<Slot>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker without starting it
    pub async fn register(
        &self,
        name: &str,
        worker: Arc<dyn Worker>,
        options: WorkerOptions,
    ) -> Result<(), SupervisorError> {
        let mut slots = self.slots.lock().await;
        if slots.iter().any(|slot| slot.name == name) {
            return Err(SupervisorError::AlreadyRegistered(name.to_string()));
        }

        let (status, _) = watch::channel(WorkerStatus {
            name: name.to_string(),
            state: WorkerState::Idle,
            last_error: None,
            runs: 0,
        });

        slots.push(Slot {
            name: name.to_string(),
            worker,
            options,
            status: Arc::new(status),
            active: None,
        });

        debug!(worker = %name, autostart = options.autostart, "Registered worker");
        Ok(())
    }

    /// Start a registered worker that is not already in flight
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let mut slots = self.slots.lock().await;
        let slot = find_slot(&mut slots, name)?;
        Self::start_slot(slot)
    }

    /// Start every autostart worker that is not in flight; returns the started names
    pub async fn start_all(&self) -> Vec<String> {
        let mut slots = self.slots.lock().await;
        let mut started = Vec::new();

        for slot in slots.iter_mut() {
            if !slot.options.autostart || slot.state().is_active() {
                continue;
            }
            if Self::start_slot(slot).is_ok() {
                started.push(slot.name.clone());
            }
        }

        started
    }

    fn start_slot(slot: &mut Slot) -> Result<(), SupervisorError> {
        if slot.state().is_active() {
            return Err(SupervisorError::AlreadyRunning(slot.name.clone()));
        }

        slot.status.send_modify(|status| {
            status.state = WorkerState::Starting;
            status.last_error = None;
        });

        let cancel = CancellationToken::new();
        let span = crate::worker_span!(worker = %slot.name);
        let handle = tokio::spawn(
            supervise(
                Arc::clone(&slot.worker),
                slot.options.restart,
                Arc::clone(&slot.status),
                cancel.clone(),
            )
            .instrument(span),
        );

        // A run that already finished keeps its terminal state
        slot.status.send_if_modified(|status| {
            if status.state == WorkerState::Starting {
                status.state = WorkerState::Running;
                true
            } else {
                false
            }
        });

        slot.active = Some(ActiveRun { cancel, handle });
        info!(worker = %slot.name, "Worker started");
        Ok(())
    }

    /// Signal cancellation and wait up to `drain_timeout` for the run to end.
    ///
    /// A run that does not end in time is aborted, marked `Failed`, and
    /// reported as `DrainTimeout`. Stopping an idle worker is a no-op.
    pub async fn stop(&self, name: &str, drain_timeout: Duration) -> Result<(), SupervisorError> {
        let (active, status) = {
            let mut slots = self.slots.lock().await;
            let slot = find_slot(&mut slots, name)?;
            let Some(active) = slot.active.take() else {
                return Ok(());
            };
            slot.status.send_if_modified(|status| {
                if matches!(status.state, WorkerState::Starting | WorkerState::Running) {
                    status.state = WorkerState::Cancelling;
                    true
                } else {
                    false
                }
            });
            (active, Arc::clone(&slot.status))
        };

        active.cancel.cancel();
        let mut handle = active.handle;

        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(_) => {
                debug!(worker = %name, state = %status.borrow().state, "Worker drained");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                status.send_if_modified(|status| {
                    if status.state.is_active() {
                        status.state = WorkerState::Failed;
                        status.last_error =
                            Some(format!("did not stop within {drain_timeout:?}"));
                        true
                    } else {
                        false
                    }
                });
                metrics().drain_timeout();
                warn!(
                    worker = %name,
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Worker did not stop in time, abandoning"
                );
                Err(SupervisorError::DrainTimeout {
                    name: name.to_string(),
                    timeout: drain_timeout,
                })
            }
        }
    }

    /// Stop every worker concurrently; total wait is bounded by `drain_timeout`
    pub async fn stop_all(&self, drain_timeout: Duration) -> StopReport {
        let names = self.names().await;
        let results = join_all(names.iter().map(|name| self.stop(name, drain_timeout))).await;

        let mut report = StopReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Err(SupervisorError::DrainTimeout { .. }) => report.timed_out.push(name),
                _ => report.stopped.push(name),
            }
        }

        if report.is_clean() {
            info!(workers = report.stopped.len(), "All workers stopped");
        } else {
            warn!(timed_out = ?report.timed_out, "Some workers did not stop in time");
        }
        report
    }

    /// Registered names in registration order
    pub async fn names(&self) -> Vec<String> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }

    pub async fn status(&self, name: &str) -> Result<WorkerStatus, SupervisorError> {
        let mut slots = self.slots.lock().await;
        let slot = find_slot(&mut slots, name)?;
        let status = slot.status.borrow().clone();
        Ok(status)
    }

    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|slot| slot.status.borrow().clone())
            .collect()
    }

    /// Subscribe to status changes of one worker
    pub async fn watch(&self, name: &str) -> Result<watch::Receiver<WorkerStatus>, SupervisorError> {
        let mut slots = self.slots.lock().await;
        let slot = find_slot(&mut slots, name)?;
        Ok(slot.status.subscribe())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().iter_mut() {
            if let Some(active) = slot.active.take() {
                active.cancel.cancel();
            }
        }
    }
}

fn find_slot<'a>(slots: &'a mut [Slot], name: &str) -> Result<&'a mut Slot, SupervisorError> {
    slots
        .iter_mut()
        .find(|slot| slot.name == name)
        .ok_or_else(|| SupervisorError::UnknownWorker(name.to_string()))
}

/// Drive one worker through its runs, isolating errors and panics
async fn supervise(
    worker: Arc<dyn Worker>,
    restart: RestartPolicy,
    status: Arc<watch::Sender<WorkerStatus>>,
    cancel: CancellationToken,
) {
    let mut restarts = 0u32;

    loop {
        status.send_modify(|status| status.runs += 1);
        metrics().worker_started();

        let outcome = AssertUnwindSafe(worker.run(cancel.clone()))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(WorkerError::StopRequested(reason))) => {
                info!(reason = %reason, "Worker requested stop");
                None
            }
            Ok(Err(WorkerError::Cancelled)) => None,
            Ok(Err(WorkerError::Failed(error))) => Some(error),
            Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
        };

        let Some(error) = error else {
            status.send_modify(|status| status.state = WorkerState::Stopped);
            metrics().worker_stopped();
            info!("Worker stopped");
            return;
        };

        metrics().worker_failed();
        error!(error = %error, runs = status.borrow().runs, "Worker failed");

        let delay = match restart {
            RestartPolicy::OnFailure {
                max_restarts,
                delay,
            } if restarts < max_restarts && !cancel.is_cancelled() => delay,
            _ => {
                status.send_modify(|status| {
                    status.state = WorkerState::Failed;
                    status.last_error = Some(error);
                });
                return;
            }
        };

        restarts += 1;
        status.send_modify(|status| {
            status.state = WorkerState::Starting;
            status.last_error = Some(error);
        });
        warn!(
            restart = restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting failed worker"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                status.send_modify(|status| status.state = WorkerState::Stopped);
                metrics().worker_stopped();
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        metrics().worker_restarted();
        status.send_if_modified(|status| {
            if status.state == WorkerState::Starting {
                status.state = WorkerState::Running;
                true
            } else {
                false
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WorkerFn;

    fn idle_worker() -> Arc<dyn Worker> {
        WorkerFn::arc(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<(), _>(WorkerError::Cancelled)
        })
    }

    async fn wait_for_state(supervisor: &TaskSupervisor, name: &str, expected: WorkerState) {
        let mut rx = supervisor.watch(name).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == expected))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_start_stop() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .register("idle", idle_worker(), WorkerOptions::default())
            .await
            .unwrap();
        assert_eq!(supervisor.status("idle").await.unwrap().state, WorkerState::Idle);

        supervisor.start("idle").await.unwrap();
        assert_eq!(supervisor.status("idle").await.unwrap().state, WorkerState::Running);

        supervisor.stop("idle", Duration::from_secs(1)).await.unwrap();
        let status = supervisor.status("idle").await.unwrap();
        assert_eq!(status.state, WorkerState::Stopped);
        assert_eq!(status.runs, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .register("w", idle_worker(), WorkerOptions::default())
            .await
            .unwrap();
        let result = supervisor
            .register("w", idle_worker(), WorkerOptions::default())
            .await;
        assert!(matches!(result, Err(SupervisorError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_start_running_worker_fails() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .register("w", idle_worker(), WorkerOptions::default())
            .await
            .unwrap();

        supervisor.start("w").await.unwrap();
        let result = supervisor.start("w").await;
        assert!(matches!(result, Err(SupervisorError::AlreadyRunning(_))));

        supervisor.stop("w", Duration::from_secs(1)).await.unwrap();
        supervisor.start("w").await.unwrap();
        assert_eq!(supervisor.status("w").await.unwrap().runs, 2);
        supervisor.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let supervisor = TaskSupervisor::new();
        assert!(matches!(
            supervisor.start("missing").await,
            Err(SupervisorError::UnknownWorker(_))
        ));
        assert!(matches!(
            supervisor.stop("missing", Duration::from_millis(10)).await,
            Err(SupervisorError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_requested_is_clean_stop() {
        let supervisor = TaskSupervisor::new();
        let worker = WorkerFn::arc(|_cancel: CancellationToken| async {
            Err::<(), _>(WorkerError::stop_requested("nothing to do"))
        });
        supervisor
            .register("noop", worker, WorkerOptions::default())
            .await
            .unwrap();

        supervisor.start("noop").await.unwrap();
        wait_for_state(&supervisor, "noop", WorkerState::Stopped).await;
        assert_eq!(supervisor.status("noop").await.unwrap().last_error, None);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_isolated() {
        let supervisor = TaskSupervisor::new();
        let worker = WorkerFn::arc(|_cancel: CancellationToken| async {
            if true {
                panic!("worker exploded");
            }
            Ok::<(), WorkerError>(())
        });
        supervisor
            .register("panics", worker, WorkerOptions::default())
            .await
            .unwrap();
        supervisor
            .register("sibling", idle_worker(), WorkerOptions::default())
            .await
            .unwrap();

        supervisor.start_all().await;
        wait_for_state(&supervisor, "panics", WorkerState::Failed).await;

        let failed = supervisor.status("panics").await.unwrap();
        assert!(failed.last_error.unwrap().contains("worker exploded"));
        assert_eq!(
            supervisor.status("sibling").await.unwrap().state,
            WorkerState::Running
        );
        supervisor.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_start_all_skips_manual_workers() {
        let supervisor = TaskSupervisor::new();
        supervisor
            .register("auto", idle_worker(), WorkerOptions::default())
            .await
            .unwrap();
        supervisor
            .register("manual", idle_worker(), WorkerOptions::manual())
            .await
            .unwrap();

        assert_eq!(supervisor.start_all().await, vec!["auto".to_string()]);
        assert_eq!(
            supervisor.status("manual").await.unwrap().state,
            WorkerState::Idle
        );
        supervisor.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_restart_on_failure_until_limit() {
        let supervisor = TaskSupervisor::new();
        let worker = WorkerFn::arc(|_cancel: CancellationToken| async {
            Err::<(), _>(WorkerError::failed("always fails"))
        });
        let options = WorkerOptions::default().with_restart(RestartPolicy::OnFailure {
            max_restarts: 2,
            delay: Duration::from_millis(5),
        });
        supervisor.register("flaky", worker, options).await.unwrap();

        supervisor.start("flaky").await.unwrap();
        wait_for_state(&supervisor, "flaky", WorkerState::Failed).await;

        let status = supervisor.status("flaky").await.unwrap();
        assert_eq!(status.runs, 3);
        assert_eq!(status.last_error.as_deref(), Some("always fails"));
    }
}
