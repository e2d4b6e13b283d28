//! `WebhookDeliverer`: claims terminal jobs carrying a pending `webhookUrl`
//! directly off the `JobStore` and delivers them, bounded by a semaphore
//! permit pool in the manner of the `dwctl` webhook dispatcher this is
//! grounded on (claim -> sign -> send, gated by `maxConcurrentWebhooks`
//! permits rather than an explicit channel stage, since delivery here reads
//! its own work directly from the store instead of draining a queue row).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use orchestrator_common::capability::WebhookTransport;
use orchestrator_common::job::{Job, JobId, JobStatus, WebhookState};
use orchestrator_common::retry::WebhookRetrySchedule;
use orchestrator_common::store::JobStore;
use orchestrator_common::webhook::{self, WebhookPayload, SIGNATURE_HEADER};

use crate::error::DispatchError;

pub struct WebhookDelivererConfig {
    pub max_attempts: u32,
    pub retry_delays: Vec<Duration>,
    pub secret: Option<String>,
    pub max_concurrent: usize,
}

pub struct WebhookDeliverer {
    store: Arc<dyn JobStore>,
    transport: Arc<dyn WebhookTransport>,
    schedule: WebhookRetrySchedule,
    max_attempts: u32,
    secret: Option<String>,
    semaphore: Arc<Semaphore>,
    /// Jobs with a delivery attempt currently in flight. `webhook_state` is
    /// only written back once `deliver_one` finishes, so without this a slow
    /// POST that outlives one tick interval would get a second concurrent
    /// attempt spawned for the same job on the next tick.
    in_flight: DashSet<JobId>,
}

impl WebhookDeliverer {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn WebhookTransport>,
        config: WebhookDelivererConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            schedule: WebhookRetrySchedule::new(config.retry_delays),
            max_attempts: config.max_attempts,
            secret: config.secret,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            in_flight: DashSet::new(),
        })
    }

    /// One Supervisor-driven tick: finds terminal jobs due for a delivery
    /// attempt right now and spawns one bounded sender task per job.
    pub async fn tick(self: &Arc<Self>) -> Result<(), DispatchError> {
        for status in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::TimedOut,
        ] {
            for job in self.store.list_by_status(status).await? {
                if !self.is_due(&job) {
                    continue;
                }

                if !self.in_flight.insert(job.id.clone()) {
                    // Already being delivered by a task spawned on an
                    // earlier tick.
                    continue;
                }

                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    self.in_flight.remove(&job.id);
                    continue;
                };

                let deliverer = Arc::clone(self);
                let job_id = job.id.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    deliverer.deliver_one(job).await;
                    deliverer.in_flight.remove(&job_id);
                });
            }
        }

        Ok(())
    }

    fn is_due(&self, job: &Job) -> bool {
        let Some(_) = &job.webhook_url else {
            return false;
        };
        if job.webhook_state.delivered {
            return false;
        }
        if job.webhook_state.attempts_made >= self.max_attempts {
            return false;
        }

        let next_attempt = job.webhook_state.attempts_made + 1;
        let Some(delay) = self.schedule.delay_before_attempt(next_attempt) else {
            return false;
        };

        match job.webhook_state.last_attempt_at {
            None => true,
            Some(last) => Utc::now() - last >= chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }

    async fn deliver_one(self: &Arc<Self>, job: Job) {
        let Some(url) = job.webhook_url.clone() else {
            return;
        };

        if let Err(error) = webhook::validate_url(&url) {
            warn!(job_id = %job.id, %error, "webhook url failed send-time revalidation");
            self.record_exhausted(&job.id, job.webhook_state.clone(), error.to_string())
                .await;
            return;
        }

        let attempt = job.webhook_state.attempts_made + 1;
        let payload = WebhookPayload::for_terminal_job(
            &job.id,
            job.caller_ref.clone(),
            job.status,
            job.operation,
            attempt,
            job.result.clone(),
            job.error.clone(),
            job.started_at.or(job.submitted_at),
            job.completed_at,
        );

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(error) => {
                warn!(job_id = %job.id, %error, "failed to serialize webhook payload");
                return;
            }
        };

        let mut headers = vec![("Content-Type".to_owned(), "application/json".to_owned())];
        if let Some(secret) = &self.secret {
            headers.push((SIGNATURE_HEADER.to_owned(), webhook::sign_payload(secret, &body)));
        }

        let outcome = self.transport.post(&url, headers, body).await;

        let mut state = job.webhook_state.clone();
        state.attempts_made = attempt;
        state.last_attempt_at = Some(Utc::now());

        match outcome {
            Ok(response) if (200..300).contains(&response.status) => {
                state.delivered = true;
                state.last_error = None;
            }
            Ok(response) => {
                state.last_error = Some(format!("http status {}", response.status));
            }
            Err(error) => {
                state.last_error = Some(error.to_string());
            }
        }

        if !state.delivered && state.attempts_made >= self.max_attempts {
            debug!(job_id = %job.id, "webhook delivery exhausted");
        }

        if let Err(error) = self.store.update_webhook_state(&job.id, state).await {
            warn!(job_id = %job.id, %error, "failed to persist webhook delivery state");
        }
    }

    async fn record_exhausted(&self, id: &JobId, mut state: WebhookState, reason: String) {
        state.attempts_made = self.max_attempts;
        state.last_error = Some(reason);
        let _ = self.store.update_webhook_state(id, state).await;
    }
}
