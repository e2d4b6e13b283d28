//! The Supervisor: one periodic task interleaving the fast dispatcher-tick
//! cadence with a slower timeout sweep, using a `Semaphore::new(1)`-guarded
//! `tokio::time::interval` loop for each cadence, both driven from a single
//! `tokio::select!`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use orchestrator_common::capability::{Clock, RemoteEndpoint};
use orchestrator_common::job::{ErrorKind, JobError, JobStatus, OperationClass};
use orchestrator_common::store::{JobStore, Mutations};

use crate::delivery::WebhookDeliverer;
use crate::error::DispatchError;
use crate::local::LocalDispatcher;
use crate::remote::RemoteDispatcher;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick_interval: Duration,
    pub timeout_check_interval: Duration,
    pub queue_timeout: Duration,
    pub execution_timeout: Duration,
}

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    remote_dispatcher: Arc<RemoteDispatcher>,
    local_dispatcher: Arc<LocalDispatcher>,
    webhook_deliverer: Arc<WebhookDeliverer>,
    remote_endpoint: Arc<dyn RemoteEndpoint>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    liveness: HealthHandle,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        remote_dispatcher: Arc<RemoteDispatcher>,
        local_dispatcher: Arc<LocalDispatcher>,
        webhook_deliverer: Arc<WebhookDeliverer>,
        remote_endpoint: Arc<dyn RemoteEndpoint>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            remote_dispatcher,
            local_dispatcher,
            webhook_deliverer,
            remote_endpoint,
            clock,
            config,
            liveness,
        }
    }

    /// Reconciles stranded state left by a previous process instance. Must
    /// run to completion before the dispatchers start ticking.
    pub async fn recover(&self) -> Result<(), DispatchError> {
        let mut stranded_remote = self.store.list_by_status(JobStatus::Submitted).await?;
        stranded_remote.extend(self.store.list_by_status(JobStatus::Processing).await?);

        let (remote_jobs, local_jobs): (Vec<_>, Vec<_>) = stranded_remote
            .into_iter()
            .partition(|job| job.operation.class() == OperationClass::Remote);

        // Remote jobs with a remote_job_id are not reset to QUEUED: the
        // dispatcher resumes polling and only requeues them if the remote
        // endpoint reports them gone, per the recovery design note.
        self.remote_dispatcher.resume_polling(remote_jobs);

        // Local jobs have no external lifecycle to resume polling against —
        // whatever was running when the process died is gone. Per the
        // RecoverWorkers contract (spec §4.1) they go back to QUEUED to be
        // re-run from scratch, not CANCELLED; the caller still gets a result.
        for job in local_jobs {
            if let Err(error) = self
                .store
                .transition_status(&job.id, job.status, JobStatus::Queued, Mutations::default())
                .await
            {
                warn!(job_id = %job.id, %error, "failed to recover stranded local job");
            }
        }

        let reconciled = self.store.reconcile_slots().await?;
        info!(active_slots = reconciled, "reconciled remote slot counter at startup");

        Ok(())
    }

    /// Runs forever, interleaving the fast tick cadence with the slower
    /// timeout sweep. Intended to be the one long-lived task `main.rs`
    /// spawns for the core's background work.
    pub async fn run(self: Arc<Self>) {
        let tick_guard = Arc::new(Semaphore::new(1));
        let sweep_guard = Arc::new(Semaphore::new(1));
        let mut tick_interval = tokio::time::interval(self.config.tick_interval);
        let mut sweep_interval = tokio::time::interval(self.config.timeout_check_interval);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.liveness.report_healthy().await;
                    let Ok(_permit) = tick_guard.clone().try_acquire_owned() else { continue };
                    if let Err(error) = self.remote_dispatcher.tick().await {
                        warn!(%error, "remote dispatcher tick failed");
                    }
                    if let Err(error) = self.local_dispatcher.tick().await {
                        warn!(%error, "local dispatcher tick failed");
                    }
                    if let Err(error) = self.webhook_deliverer.tick().await {
                        warn!(%error, "webhook deliverer tick failed");
                    }
                }
                _ = sweep_interval.tick() => {
                    let Ok(_permit) = sweep_guard.clone().try_acquire_owned() else { continue };
                    if let Err(error) = self.sweep_timeouts().await {
                        warn!(%error, "timeout sweep failed");
                    }
                }
            }
        }
    }

    /// Fails QUEUED jobs past `queueTimeout` and times out SUBMITTED/PROCESSING
    /// jobs past `executionTimeout`. Exposed as its own entry point (rather
    /// than only reachable via `run`'s interval) so a caller can force a sweep
    /// off its own cadence.
    pub async fn sweep_timeouts(&self) -> Result<(), DispatchError> {
        let now = self.clock.now();

        for job in self.store.list_by_status(JobStatus::Queued).await? {
            if now - job.created_at >= to_chrono(self.config.queue_timeout) {
                let result = self
                    .store
                    .transition_status(
                        &job.id,
                        JobStatus::Queued,
                        JobStatus::Failed,
                        Mutations {
                            completed_at: Some(now),
                            error: Some(JobError::new(ErrorKind::QueueTimeout, "exceeded queueTimeout while queued")),
                            ..Default::default()
                        },
                    )
                    .await;
                if let Err(error) = result {
                    warn!(job_id = %job.id, %error, "failed to fail queue-timed-out job");
                }
            }
        }

        for status in [JobStatus::Submitted, JobStatus::Processing] {
            for job in self.store.list_by_status(status).await? {
                // Remote jobs always have `submitted_at` set on the QUEUED ->
                // SUBMITTED transition; local jobs skip SUBMITTED entirely and
                // only set `started_at`. Fall back so local PROCESSING jobs
                // are still subject to `executionTimeout`.
                let Some(reference) = job.submitted_at.or(job.started_at) else { continue };
                if now - reference < to_chrono(self.config.execution_timeout) {
                    continue;
                }

                let result = self
                    .store
                    .transition_status(
                        &job.id,
                        status,
                        JobStatus::TimedOut,
                        Mutations {
                            remote_job_id: Some(None),
                            completed_at: Some(now),
                            error: Some(JobError::new(ErrorKind::ExecutionTimeout, "exceeded executionTimeout")),
                            ..Default::default()
                        },
                    )
                    .await;

                match result {
                    Ok(_) => {
                        if job.operation.class() == OperationClass::Remote {
                            self.store.release_slot(&job.id).await?;
                            if let Some(remote_job_id) = &job.remote_job_id {
                                let _ = self.remote_endpoint.cancel(remote_job_id).await;
                            }
                        } else {
                            self.local_dispatcher.cancel(&job.id);
                        }
                    }
                    Err(error) => warn!(job_id = %job.id, %error, "failed to time out job"),
                }
            }
        }

        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_default()
}
