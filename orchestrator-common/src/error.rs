use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors surfaced by a `JobStore` implementation.
#[derive(Error, Debug)]
pub enum JobStoreError {
    #[error("job {job_id} expected status {expected:?} but found {actual:?}")]
    PreconditionFailed {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("no remote slots available: {active}/{max} in use")]
    NoSlotsAvailable { active: i64, max: i64 },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors from the `RemoteEndpoint` capability.
#[derive(Error, Debug)]
pub enum RemoteEndpointError {
    #[error("remote job not found")]
    NotFound,
    #[error("remote endpoint error: {0}")]
    Other(String),
}

/// Errors from the `WebhookTransport` capability.
#[derive(Error, Debug)]
pub enum WebhookTransportError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),
    #[error("webhook request failed: {0}")]
    Request(String),
}
