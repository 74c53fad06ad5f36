//! Managed lifecycle for long-running background workers
//!
//! - [`worker`] - the `Worker` capability, its states, errors and options
//! - [`task_supervisor`] - start/stop/drain with crash isolation

pub mod task_supervisor;
pub mod worker;

pub use task_supervisor::{StopReport, SupervisorError, TaskSupervisor, WorkerStatus};
pub use worker::{RestartPolicy, Worker, WorkerError, WorkerFn, WorkerOptions, WorkerState};
