use thiserror::Error;

use orchestrator_common::{JobId, JobStoreError};

/// Errors a dispatcher or the Supervisor can encounter mid-tick. Most of
/// these are logged and folded into a job's `error` field rather than
/// propagated — see the propagation policy on `JobServiceError`.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("remote endpoint error: {0}")]
    Remote(String),
    #[error("local executor error: {0}")]
    Local(String),
}

/// The only errors `JobService` returns to its caller (the ingress layer).
/// Every other failure mode is recorded on the job record and observed
/// through its terminal state, per the core's error propagation policy.
#[derive(Error, Debug)]
pub enum JobServiceError {
    #[error("job {0} does not exist")]
    UnknownJob(JobId),
    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
