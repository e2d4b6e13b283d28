//! An in-process `JobStore`, used by the worker's integration tests and by
//! any deployment that doesn't need the queue to survive a restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::JobStoreError;
use crate::job::{Job, JobId, JobStatus, NewJob, OperationClass, WebhookState};
use crate::job::new_job_id;

use super::{JobStore, Mutations};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Ids of jobs currently holding a remote slot. A `HashSet` rather than a
    /// bare counter so `release_slot` can tell whether a given job actually
    /// holds one, which is what makes it idempotent per job.
    remote_slots: RwLock<HashSet<JobId>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            remote_slots: RwLock::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let id = new_job_id();
        let job = Job {
            id: id.clone(),
            operation: new_job.operation,
            payload: new_job.payload,
            webhook_url: new_job.webhook_url,
            caller_ref: new_job.caller_ref,
            status: JobStatus::Queued,
            remote_job_id: None,
            attempts: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            submitted_at: None,
            started_at: None,
            completed_at: None,
            webhook_state: WebhookState::default(),
        };

        self.jobs.write().await.insert(id.clone(), job);
        Ok(id)
    }

    async fn get_queued(
        &self,
        class: OperationClass,
        limit: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.operation.class() == class)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn get(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))
    }

    async fn transition_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        to: JobStatus,
        mutations: Mutations,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        if job.status != expected {
            return Err(JobStoreError::PreconditionFailed {
                job_id: id.clone(),
                expected,
                actual: job.status,
            });
        }

        job.status = to;
        if expected == JobStatus::Queued {
            job.attempts += 1;
        }
        if let Some(remote_job_id) = mutations.remote_job_id {
            job.remote_job_id = remote_job_id;
        }
        if let Some(result) = mutations.result {
            job.result = Some(result);
        }
        if let Some(error) = mutations.error {
            job.error = Some(error);
        }
        if let Some(submitted_at) = mutations.submitted_at {
            job.submitted_at = Some(submitted_at);
        }
        if let Some(started_at) = mutations.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = mutations.completed_at {
            job.completed_at = Some(completed_at);
        }

        Ok(job.clone())
    }

    async fn acquire_slot(&self, job_id: &JobId, max: i64) -> Result<i64, JobStoreError> {
        let mut slots = self.remote_slots.write().await;
        if slots.contains(job_id) {
            return Ok(slots.len() as i64);
        }
        let current = slots.len() as i64;
        if current >= max {
            return Err(JobStoreError::NoSlotsAvailable { active: current, max });
        }
        slots.insert(job_id.clone());
        Ok(current + 1)
    }

    async fn release_slot(&self, job_id: &JobId) -> Result<(), JobStoreError> {
        self.remote_slots.write().await.remove(job_id);
        Ok(())
    }

    async fn active_slots(&self) -> Result<i64, JobStoreError> {
        Ok(self.remote_slots.read().await.len() as i64)
    }

    async fn list_active_remote(&self) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.holds_remote_slot())
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn update_webhook_state(
        &self,
        id: &JobId,
        state: WebhookState,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        job.webhook_state = state;
        Ok(())
    }

    async fn prune(&self, older_than: chrono::DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.map(|at| at < older_than).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn reconcile_slots(&self) -> Result<i64, JobStoreError> {
        let held: HashSet<JobId> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.holds_remote_slot())
            .map(|job| job.id.clone())
            .collect();
        let actual = held.len() as i64;
        *self.remote_slots.write().await = held;
        Ok(actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Operation;
    use serde_json::json;

    fn sample_job() -> NewJob {
        NewJob {
            operation: Operation::Caption,
            payload: json!({"video_url": "https://example.com/v.mp4"}),
            webhook_url: None,
            caller_ref: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_get_roundtrips() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(sample_job()).await.unwrap();
        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.operation, Operation::Caption);
    }

    #[tokio::test]
    async fn transition_enforces_precondition() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(sample_job()).await.unwrap();

        store
            .transition_status(&id, JobStatus::Queued, JobStatus::Submitted, Mutations::default())
            .await
            .unwrap();

        let result = store
            .transition_status(&id, JobStatus::Queued, JobStatus::Submitted, Mutations::default())
            .await;

        assert!(matches!(
            result,
            Err(JobStoreError::PreconditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn slot_accounting_rejects_once_full() {
        let store = MemoryJobStore::new();
        let holder = store.enqueue(sample_job()).await.unwrap();
        let other = store.enqueue(sample_job()).await.unwrap();

        assert_eq!(store.acquire_slot(&holder, 1).await.unwrap(), 1);
        assert!(matches!(
            store.acquire_slot(&other, 1).await,
            Err(JobStoreError::NoSlotsAvailable { active: 1, max: 1 })
        ));
        store.release_slot(&holder).await.unwrap();
        assert_eq!(store.acquire_slot(&other, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn slot_release_is_idempotent_per_job() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(sample_job()).await.unwrap();

        assert_eq!(store.acquire_slot(&id, 4).await.unwrap(), 1);
        store.release_slot(&id).await.unwrap();
        // Releasing a job that no longer holds a slot is a no-op, not an
        // underflow: a second release must not make active_slots negative.
        store.release_slot(&id).await.unwrap();
        assert_eq!(store.active_slots().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slot_acquire_is_idempotent_per_job() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(sample_job()).await.unwrap();

        assert_eq!(store.acquire_slot(&id, 1).await.unwrap(), 1);
        // Acquiring again for the same job doesn't consume a second slot.
        assert_eq!(store.acquire_slot(&id, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_queued_filters_by_class_and_status() {
        let store = MemoryJobStore::new();
        let remote_id = store.enqueue(sample_job()).await.unwrap();
        let mut local_job = sample_job();
        local_job.operation = Operation::CaptionLocal;
        store.enqueue(local_job).await.unwrap();

        let queued = store.get_queued(OperationClass::Remote, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, remote_id);
    }
}
