//! Units of supervised background work
//!
//! A [`Worker`] is a factory: every call to [`Worker::run`] produces a fresh
//! run bound to its own cancellation token. Workers observe cancellation at
//! their suspension points and return promptly.

use crate::broker::BrokerError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Outcome of a worker run other than plain success
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker chose to stop; treated as a clean stop
    #[error("stop requested: {0}")]
    StopRequested(String),
    /// The run observed its cancellation token; treated as a clean stop
    #[error("cancelled")]
    Cancelled,
    /// Unhandled failure; the worker is marked failed
    #[error("{0}")]
    Failed(String),
}

impl WorkerError {
    pub fn failed(error: impl fmt::Display) -> Self {
        WorkerError::Failed(error.to_string())
    }

    pub fn stop_requested(reason: impl Into<String>) -> Self {
        WorkerError::StopRequested(reason.into())
    }

    /// True for outcomes that end in `Stopped` rather than `Failed`
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, WorkerError::StopRequested(_) | WorkerError::Cancelled)
    }
}

impl From<BrokerError> for WorkerError {
    fn from(error: BrokerError) -> Self {
        WorkerError::Failed(error.to_string())
    }
}

/// Lifecycle state of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Registered, never started
    Idle,
    Starting,
    Running,
    /// Cancellation signaled, waiting for the run to unwind
    Cancelling,
    Stopped,
    Failed,
}

impl WorkerState {
    /// States in which a run is in flight
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Cancelling
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Cancelling => "cancelling",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the supervisor does when a run fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stay `Failed` until started again
    #[default]
    Never,
    /// Restart up to `max_restarts` times, waiting `delay` before each
    OnFailure { max_restarts: u32, delay: Duration },
}

/// Registration options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Started by `start_all()`
    pub autostart: bool,
    pub restart: RestartPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            autostart: true,
            restart: RestartPolicy::Never,
        }
    }
}

impl WorkerOptions {
    /// Registered but only started explicitly
    pub fn manual() -> Self {
        Self {
            autostart: false,
            ..Self::default()
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// Long-running unit of work managed by the supervisor
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run until `cancel` fires, the work ends, or it fails
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError>;
}

/// Closure-backed [`Worker`]; each run creates a fresh future
pub struct WorkerFn<F> {
    f: F,
}

impl<F> WorkerFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn arc(f: F) -> Arc<Self> {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Worker for WorkerFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkerError>> + Send,
{
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        (self.f)(cancel).await
    }
}
