//! The remote-serverless dispatcher. Owns every job whose operation class is
//! `Remote`: submission, slot accounting, and per-job polling on an
//! exponential backoff, one `tokio::spawn`ed task per active submission.
//! Concurrency is bounded by `activeSlots`, not a permit pool.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orchestrator_common::capability::{Clock, RemoteEndpoint, RemoteState};
use orchestrator_common::job::{ErrorKind, Job, JobError, JobId, JobStatus, OperationClass};
use orchestrator_common::retry::PollBackoff;
use orchestrator_common::store::{JobStore, Mutations};

use crate::error::DispatchError;
use crate::fanout::{self, FanoutState, SiblingState};

#[derive(Debug, Clone)]
pub struct RemoteDispatcherConfig {
    pub max_remote_slots: i64,
    pub poll_initial_delay: Duration,
    pub poll_max_delay: Duration,
    pub poll_backoff_factor: f64,
    pub max_poll_errors: u32,
    pub initial_grace_period: Duration,
    pub fanout_threshold: usize,
    pub fanout_max_siblings: usize,
}

pub struct RemoteDispatcher {
    store: Arc<dyn JobStore>,
    endpoint: Arc<dyn RemoteEndpoint>,
    clock: Arc<dyn Clock>,
    config: RemoteDispatcherConfig,
    cancel_tokens: DashMap<JobId, CancellationToken>,
    fanouts: DashMap<JobId, FanoutState>,
}

impl RemoteDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        endpoint: Arc<dyn RemoteEndpoint>,
        clock: Arc<dyn Clock>,
        config: RemoteDispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            endpoint,
            clock,
            config,
            cancel_tokens: DashMap::new(),
            fanouts: DashMap::new(),
        })
    }

    /// One Supervisor-driven tick: drains up to the current free-slot budget
    /// in FIFO order, submits each, and spawns its poll task. Does not await
    /// poll completion.
    pub async fn tick(self: &Arc<Self>) -> Result<(), DispatchError> {
        let active = self.store.active_slots().await?;
        let free_slots = (self.config.max_remote_slots - active).max(0);
        if free_slots == 0 {
            return Ok(());
        }

        let queued = self
            .store
            .get_queued(OperationClass::Remote, free_slots as u32)
            .await?;

        for job in queued {
            if self.store.acquire_slot(&job.id, self.config.max_remote_slots).await.is_err() {
                // Another tick or racing acquirer took the last slot between
                // our budget check and now; stop draining this round.
                break;
            }

            let dispatcher = Arc::clone(self);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                if let Err(error) = dispatcher.submit_and_poll(job).await {
                    warn!(job_id = %job_id, %error, "remote submission failed");
                }
            });
        }

        Ok(())
    }

    /// Resumes polling for jobs already SUBMITTED/PROCESSING after a restart,
    /// called once by `main.rs` after `JobStore::recover_workers` has run.
    /// Per spec §4.5, these are not resubmitted; the first poll decides
    /// whether they are still alive.
    pub fn resume_polling(self: &Arc<Self>, jobs: Vec<Job>) {
        for job in jobs {
            if job.operation.class() != OperationClass::Remote {
                continue;
            }
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.poll_until_terminal(job).await;
            });
        }
    }

    async fn submit_and_poll(self: &Arc<Self>, job: Job) -> Result<(), DispatchError> {
        if fanout::should_fanout(&job.payload, self.config.fanout_threshold) {
            return self.submit_fanout(job).await;
        }

        let submitted_at = self.clock.now();
        match self.endpoint.submit(&job.payload).await {
            Ok(remote_job_id) => {
                let job = self
                    .store
                    .transition_status(
                        &job.id,
                        JobStatus::Queued,
                        JobStatus::Submitted,
                        Mutations {
                            remote_job_id: Some(Some(remote_job_id)),
                            submitted_at: Some(submitted_at),
                            ..Default::default()
                        },
                    )
                    .await?;

                self.poll_until_terminal(job).await;
                Ok(())
            }
            Err(error) => {
                self.store.release_slot(&job.id).await?;
                self.store
                    .transition_status(
                        &job.id,
                        JobStatus::Queued,
                        JobStatus::Failed,
                        Mutations {
                            completed_at: Some(self.clock.now()),
                            error: Some(JobError::new(ErrorKind::SubmitFailed, error.to_string())),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn submit_fanout(self: &Arc<Self>, job: Job) -> Result<(), DispatchError> {
        let chunks = fanout::plan_chunks(&job.payload, self.config.fanout_max_siblings);
        let mut siblings = Vec::with_capacity(chunks.len());

        for chunk in &chunks {
            match self.endpoint.submit(chunk).await {
                Ok(remote_job_id) => siblings.push(SiblingState {
                    remote_job_id,
                    state: None,
                    output: None,
                    error: None,
                }),
                Err(error) => {
                    // Best-effort cancel of any siblings already accepted.
                    for sibling in &siblings {
                        let _ = self.endpoint.cancel(&sibling.remote_job_id).await;
                    }
                    self.store.release_slot(&job.id).await?;
                    self.store
                        .transition_status(
                            &job.id,
                            JobStatus::Queued,
                            JobStatus::Failed,
                            Mutations {
                                completed_at: Some(self.clock.now()),
                                error: Some(JobError::new(ErrorKind::SubmitFailed, error.to_string())),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Ok(());
                }
            }
        }

        let remote_job_id = siblings
            .iter()
            .map(|s| s.remote_job_id.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let job = self
            .store
            .transition_status(
                &job.id,
                JobStatus::Queued,
                JobStatus::Submitted,
                Mutations {
                    remote_job_id: Some(Some(remote_job_id)),
                    submitted_at: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;

        self.fanouts
            .insert(job.id.clone(), FanoutState { siblings });

        self.poll_fanout_until_terminal(job).await;
        Ok(())
    }

    async fn poll_fanout_until_terminal(self: &Arc<Self>, job: Job) {
        let token = CancellationToken::new();
        self.cancel_tokens.insert(job.id.clone(), token.clone());
        let mut started = false;

        loop {
            if token.is_cancelled() {
                break;
            }

            self.clock.sleep(Duration::from_millis(500)).await;

            let mut state = match self.fanouts.get(&job.id) {
                Some(entry) => entry.value().clone(),
                None => break,
            };

            for sibling in state.siblings.iter_mut() {
                if matches!(
                    sibling.state,
                    Some(RemoteState::Completed | RemoteState::Failed | RemoteState::Cancelled | RemoteState::TimedOut)
                ) {
                    continue;
                }
                match self.endpoint.status(&sibling.remote_job_id).await {
                    Ok(report) => {
                        sibling.state = Some(report.state);
                        sibling.output = report.output;
                        sibling.error = report.error;
                    }
                    Err(error) => sibling.error = Some(error.to_string()),
                }
            }

            self.fanouts.insert(job.id.clone(), state.clone());

            if !started && state.siblings.iter().any(|s| s.state == Some(RemoteState::InProgress)) {
                started = true;
                let _ = self
                    .store
                    .transition_status(
                        &job.id,
                        JobStatus::Submitted,
                        JobStatus::Processing,
                        Mutations {
                            started_at: Some(self.clock.now()),
                            ..Default::default()
                        },
                    )
                    .await;
            }

            if state.all_terminal() {
                let from = if started {
                    JobStatus::Processing
                } else {
                    JobStatus::Submitted
                };

                let result = if state.any_failed() {
                    for sibling in &state.siblings {
                        if sibling.state != Some(RemoteState::Failed) {
                            let _ = self.endpoint.cancel(&sibling.remote_job_id).await;
                        }
                    }
                    self.store
                        .transition_status(
                            &job.id,
                            from,
                            JobStatus::Failed,
                            Mutations {
                                remote_job_id: Some(None),
                                completed_at: Some(self.clock.now()),
                                error: Some(JobError::new(
                                    ErrorKind::PartialFailure,
                                    "one or more fanout siblings failed",
                                )),
                                ..Default::default()
                            },
                        )
                        .await
                } else {
                    self.store
                        .transition_status(
                            &job.id,
                            from,
                            JobStatus::Completed,
                            Mutations {
                                remote_job_id: Some(None),
                                completed_at: Some(self.clock.now()),
                                result: Some(state.merged_output()),
                                ..Default::default()
                            },
                        )
                        .await
                };

                match &result {
                    Ok(_) => {
                        let _ = self.store.release_slot(&job.id).await;
                    }
                    Err(error) => warn!(job_id = %job.id, %error, "failed to persist fanout terminal state"),
                }
                self.fanouts.remove(&job.id);
                self.cancel_tokens.remove(&job.id);
                break;
            }
        }
    }

    async fn poll_until_terminal(self: &Arc<Self>, job: Job) {
        if self.fanouts.contains_key(&job.id) {
            self.poll_fanout_until_terminal(job).await;
            return;
        }

        let token = CancellationToken::new();
        self.cancel_tokens.insert(job.id.clone(), token.clone());

        let mut backoff = PollBackoff::new(
            self.config.poll_initial_delay,
            self.config.poll_backoff_factor,
            self.config.poll_max_delay,
        );
        let poll_errors = AtomicU32::new(0);
        let mut status = job.status;
        let submitted_at = job.submitted_at.unwrap_or_else(|| self.clock.now());
        let remote_job_id = match job.remote_job_id.clone() {
            Some(id) => id,
            None => return,
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.clock.sleep(backoff.next()) => {}
            }

            match self.endpoint.status(&remote_job_id).await {
                Ok(report) => {
                    poll_errors.store(0, Ordering::SeqCst);
                    match report.state {
                        RemoteState::InQueue => continue,
                        RemoteState::InProgress => {
                            if status == JobStatus::Submitted {
                                match self
                                    .store
                                    .transition_status(
                                        &job.id,
                                        JobStatus::Submitted,
                                        JobStatus::Processing,
                                        Mutations {
                                            started_at: Some(self.clock.now()),
                                            ..Default::default()
                                        },
                                    )
                                    .await
                                {
                                    Ok(_) => status = JobStatus::Processing,
                                    Err(error) => {
                                        debug!(job_id = %job.id, %error, "processing transition lost race");
                                        break;
                                    }
                                }
                            }
                        }
                        terminal => {
                            self.finish(&job.id, status, terminal, report.output, report.error)
                                .await;
                            break;
                        }
                    }
                }
                Err(error) if is_not_found(&error) => {
                    if self.clock.now() - submitted_at < chrono::Duration::from_std(self.config.initial_grace_period).unwrap_or_default() {
                        continue;
                    }
                    self.finish_failed(&job.id, status, ErrorKind::Vanished, "remote job vanished past grace period")
                        .await;
                    break;
                }
                Err(error) => {
                    let errors = poll_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    if errors >= self.config.max_poll_errors {
                        self.finish_failed(&job.id, status, ErrorKind::PollError, &error.to_string())
                            .await;
                        break;
                    }
                }
            }
        }

        self.cancel_tokens.remove(&job.id);
    }

    async fn finish(
        &self,
        job_id: &JobId,
        from: JobStatus,
        remote_state: RemoteState,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let to = match remote_state {
            RemoteState::Completed => JobStatus::Completed,
            RemoteState::Failed => JobStatus::Failed,
            RemoteState::Cancelled => JobStatus::Cancelled,
            RemoteState::TimedOut => JobStatus::TimedOut,
            RemoteState::InQueue | RemoteState::InProgress => return,
        };

        let job_error = error.map(|message| {
            JobError::new(
                if to == JobStatus::Cancelled {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::ExecutorError
                },
                message,
            )
        });

        let result = self
            .store
            .transition_status(
                job_id,
                from,
                to,
                Mutations {
                    remote_job_id: Some(None),
                    result: output,
                    error: job_error,
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;

        // Only release the slot if this transition actually landed. If it
        // lost a race (e.g. a concurrent cancel already moved the job to a
        // terminal status and released the slot itself), releasing again
        // here would double-release it.
        match &result {
            Ok(_) => {
                let _ = self.store.release_slot(job_id).await;
            }
            Err(error) => warn!(job_id = %job_id, %error, "failed to persist remote terminal state"),
        }
    }

    async fn finish_failed(&self, job_id: &JobId, from: JobStatus, kind: ErrorKind, message: &str) {
        let result = self
            .store
            .transition_status(
                job_id,
                from,
                JobStatus::Failed,
                Mutations {
                    remote_job_id: Some(None),
                    error: Some(JobError::new(kind, message)),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;

        match &result {
            Ok(_) => {
                let _ = self.store.release_slot(job_id).await;
            }
            Err(error) => warn!(job_id = %job_id, %error, "failed to persist remote failure"),
        }
    }

    /// Cancels a job this dispatcher owns: transitions it to CANCELLED,
    /// stops its poll task, and best-effort cancels it on the remote
    /// endpoint. Does not wait on the remote call.
    pub async fn cancel(&self, job: &Job) -> Result<(), DispatchError> {
        let from = job.status;
        if from.is_terminal() {
            return Ok(());
        }

        self.store
            .transition_status(
                &job.id,
                from,
                JobStatus::Cancelled,
                Mutations {
                    remote_job_id: Some(None),
                    completed_at: Some(Utc::now()),
                    error: Some(JobError::new(ErrorKind::Cancelled, "cancelled by caller")),
                    ..Default::default()
                },
            )
            .await?;

        if from.holds_remote_slot() {
            self.store.release_slot(&job.id).await?;
        }

        if let Some((_, token)) = self.cancel_tokens.remove(&job.id) {
            token.cancel();
        }

        if let Some(remote_job_id) = &job.remote_job_id {
            let endpoint = Arc::clone(&self.endpoint);
            let remote_job_id = remote_job_id.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move {
                if let Err(error) = endpoint.cancel(&remote_job_id).await {
                    debug!(job_id = %job_id, %error, "best-effort remote cancel failed");
                }
            });
        }

        Ok(())
    }
}

fn is_not_found(error: &orchestrator_common::error::RemoteEndpointError) -> bool {
    matches!(error, orchestrator_common::error::RemoteEndpointError::NotFound)
}
