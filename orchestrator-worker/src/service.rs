//! `JobService`: the façade the ingress layer calls. It never touches a
//! Capability directly — enqueue only writes to the `JobStore`; cancellation
//! additionally reaches into whichever dispatcher owns the job's operation
//! class to flip its cancel signal.

use std::sync::Arc;

use chrono::Utc;

use orchestrator_common::job::{ErrorKind, Job, JobError, JobId, JobStatus, NewJob, OperationClass};
use orchestrator_common::store::{JobStore, Mutations};

use crate::error::JobServiceError;
use crate::local::LocalDispatcher;
use crate::remote::RemoteDispatcher;

pub struct JobService {
    store: Arc<dyn JobStore>,
    remote: Arc<RemoteDispatcher>,
    local: Arc<LocalDispatcher>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<RemoteDispatcher>,
        local: Arc<LocalDispatcher>,
    ) -> Self {
        Self {
            store,
            remote,
            local,
        }
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, JobServiceError> {
        Ok(self.store.enqueue(job).await?)
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, JobServiceError> {
        self.store
            .get(id)
            .await
            .map_err(|_| JobServiceError::UnknownJob(id.clone()))
    }

    /// Non-blocking: flips the store status to CANCELLED and signals the
    /// owning dispatcher. Effective cancellation latency is bounded by the
    /// next dispatcher tick or executor checkpoint, never this call.
    pub async fn cancel(&self, id: &JobId) -> Result<(), JobServiceError> {
        let job = self
            .store
            .get(id)
            .await
            .map_err(|_| JobServiceError::UnknownJob(id.clone()))?;

        if job.status.is_terminal() {
            return Err(JobServiceError::AlreadyTerminal(id.clone()));
        }

        // A job still QUEUED hasn't reached either dispatcher yet: cancel it
        // outright rather than signalling a task that doesn't exist.
        if job.status == JobStatus::Queued {
            self.store
                .transition_status(
                    id,
                    JobStatus::Queued,
                    JobStatus::Cancelled,
                    Mutations {
                        completed_at: Some(Utc::now()),
                        error: Some(JobError::new(ErrorKind::Cancelled, "cancelled by caller")),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        match job.operation.class() {
            OperationClass::Remote => self.remote.cancel(&job).await?,
            OperationClass::Local => self.local.cancel(id),
        }

        Ok(())
    }
}
