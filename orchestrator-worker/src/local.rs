//! The local-executor dispatcher. Owns every job whose operation class is
//! `Local`, running each on a bounded internal worker pool gated by a
//! `Semaphore` — the same `Semaphore`-bounded concurrent-task shape the
//! teacher's `WebhookWorker::run` uses for HTTP delivery, here applied to
//! `LocalExecutor::run` calls instead. Local jobs never touch the remote
//! slot counter.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use orchestrator_common::capability::LocalExecutor;
use orchestrator_common::job::{ErrorKind, Job, JobError, JobId, JobStatus, OperationClass};
use orchestrator_common::store::{JobStore, Mutations};

use crate::error::DispatchError;

pub struct LocalDispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn LocalExecutor>,
    semaphore: Arc<Semaphore>,
    cancel_tokens: DashMap<JobId, CancellationToken>,
    max_local_jobs: usize,
}

impl LocalDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn LocalExecutor>,
        max_local_jobs: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            semaphore: Arc::new(Semaphore::new(max_local_jobs)),
            cancel_tokens: DashMap::new(),
            max_local_jobs,
        })
    }

    pub async fn tick(self: &Arc<Self>) -> Result<(), DispatchError> {
        let free = self.semaphore.available_permits();
        if free == 0 {
            return Ok(());
        }

        metrics::gauge!("local_dispatcher_saturation_percent").set(
            1f64 - free as f64 / self.max_local_jobs as f64,
        );

        let queued = self
            .store
            .get_queued(OperationClass::Local, free as u32)
            .await?;

        for job in queued {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.run_one(job).await;
            });
        }

        Ok(())
    }

    async fn run_one(self: &Arc<Self>, job: Job) {
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };

        let job = match self
            .store
            .transition_status(
                &job.id,
                JobStatus::Queued,
                JobStatus::Processing,
                Mutations {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(job) => job,
            Err(error) => {
                warn!(job_id = %job.id, %error, "lost race acquiring queued local job");
                return;
            }
        };

        let token = CancellationToken::new();
        self.cancel_tokens.insert(job.id.clone(), token.clone());

        let outcome = self
            .executor
            .run(job.operation, job.payload.clone(), token.clone())
            .await;

        self.cancel_tokens.remove(&job.id);
        drop(permit);

        // A cancel signalled while the executor was running still wins: the
        // job is CANCELLED regardless of what the executor returned, per
        // §4.3 ("if it ignores it, the job is still marked CANCELLED").
        let (to, mutations) = if token.is_cancelled() {
            (
                JobStatus::Cancelled,
                Mutations {
                    completed_at: Some(Utc::now()),
                    error: Some(JobError::new(ErrorKind::Cancelled, "cancelled by caller")),
                    ..Default::default()
                },
            )
        } else {
            match outcome {
                Ok(result) => (
                    JobStatus::Completed,
                    Mutations {
                        completed_at: Some(Utc::now()),
                        result: Some(result),
                        ..Default::default()
                    },
                ),
                Err(message) => (
                    JobStatus::Failed,
                    Mutations {
                        completed_at: Some(Utc::now()),
                        error: Some(JobError::new(ErrorKind::ExecutorError, message)),
                        ..Default::default()
                    },
                ),
            }
        };

        if let Err(error) = self
            .store
            .transition_status(&job.id, JobStatus::Processing, to, mutations)
            .await
        {
            warn!(job_id = %job.id, %error, "failed to persist local terminal state");
        }
    }

    /// Flips the cancellation signal for an active job. A no-op if the job
    /// isn't currently running (e.g. it already finished, or cancellation
    /// raced a dispatch and lost): `JobService::cancel` has already moved the
    /// store's record in that case.
    pub fn cancel(&self, id: &JobId) {
        if let Some(token) = self.cancel_tokens.get(id) {
            token.cancel();
        }
    }
}
