//! Error types surfaced by the scheduler and the worker pool.
//!
//! Only rejected submissions and invalid requests are errors. An empty queue is reported as
//! `None`, and a panicking job is contained inside its worker; its outcome is only visible through
//! a [`JobHandle`](crate::worker_pool::JobHandle).

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The worker pool is not running; the job was not accepted and will never run.
    #[error("worker pool is stopped, job rejected")]
    PoolStopped,

    /// The scheduler has been shut down and no longer accepts tasks.
    #[error("scheduler is shutting down, task rejected")]
    ShuttingDown,

    /// Recurring tasks need a non-zero period.
    #[error("recurring interval must be greater than zero")]
    InvalidInterval,

    /// The OS refused to spawn a worker or dispatch thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of a job that was accepted but did not complete normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was dropped before it ran (e.g. still queued at teardown).
    #[error("job was discarded before it ran")]
    Discarded,
}
