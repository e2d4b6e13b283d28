//! The `JobStore` capability: the single point of truth for job state and
//! the remote-slot counter. All status transitions, slot accounting and
//! webhook bookkeeping are mediated here so the dispatchers never race each
//! other over a job's fields.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobStoreError;
use crate::job::{Job, JobError, JobId, JobStatus, NewJob, OperationClass, WebhookState};

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

/// Field-level changes applied by `transition_status`. Every field besides
/// `status` is optional so a single call can carry whatever the calling
/// dispatcher learned (e.g. `RemoteDispatcher` setting `remote_job_id` on the
/// QUEUED -> SUBMITTED transition, or `result`/`error` on a terminal one).
///
/// `remote_job_id` is tri-state rather than a plain `Option<String>`: `None`
/// leaves the column untouched, `Some(None)` explicitly clears it, and
/// `Some(Some(id))` sets it. Every terminal transition must pass
/// `Some(None)` so a completed/failed/cancelled/timed-out job doesn't keep
/// pointing at a remote id that no longer means anything.
#[derive(Debug, Clone, Default)]
pub struct Mutations {
    pub remote_job_id: Option<Option<String>>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub submitted_at: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The persistence interface the orchestrator core depends on. Implementations
/// must make `acquire_slot` and `transition_status` atomic with respect to
/// concurrent callers: two dispatchers racing to acquire the last slot, or to
/// transition the same job, must not both succeed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job in `QUEUED` status and returns its generated id.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Fetches up to `limit` `QUEUED` jobs of the given operation class,
    /// oldest first. Used by the dispatchers to find work; does not itself
    /// change status or acquire slots.
    async fn get_queued(&self, class: OperationClass, limit: u32) -> Result<Vec<Job>, JobStoreError>;

    /// Fetches a single job by id.
    async fn get(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Moves `id` from `expected` to `to`, applying `mutations`, only if the
    /// job's current status is exactly `expected`. Returns
    /// `JobStoreError::PreconditionFailed` if it has since moved (e.g. a
    /// concurrent cancellation).
    async fn transition_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        to: JobStatus,
        mutations: Mutations,
    ) -> Result<Job, JobStoreError>;

    /// Atomically increments the remote-slot counter if `active < max`,
    /// returning the new count. Returns `NoSlotsAvailable` otherwise. Calling
    /// again for a `job_id` that already holds a slot is a no-op that
    /// returns the current count rather than double-counting it.
    async fn acquire_slot(&self, job_id: &JobId, max: i64) -> Result<i64, JobStoreError>;

    /// Decrements the remote-slot counter, but only if `job_id` currently
    /// holds one. Idempotent per `job_id`: a second release for a job that
    /// already released (or never acquired) is a no-op, so a caller racing
    /// a cancellation against its own cleanup path can never double-release.
    async fn release_slot(&self, job_id: &JobId) -> Result<(), JobStoreError>;

    /// The current remote-slot count, for metrics and the Supervisor's leak
    /// detection pass.
    async fn active_slots(&self) -> Result<i64, JobStoreError>;

    /// All jobs in a non-terminal status holding a remote slot
    /// (`SUBMITTED`/`PROCESSING`), used by `Supervisor::recover_workers` after
    /// a crash/restart to reconcile the slot counter against real state.
    async fn list_active_remote(&self) -> Result<Vec<Job>, JobStoreError>;

    /// All jobs currently in `status`, for the Supervisor's timeout sweep.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError>;

    /// Applies a new `WebhookState` to a job, independent of its `status`.
    async fn update_webhook_state(
        &self,
        id: &JobId,
        state: WebhookState,
    ) -> Result<(), JobStoreError>;

    /// Deletes terminal jobs older than `older_than`, returning the number
    /// removed. Used by the janitor's retention sweep.
    async fn prune(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64, JobStoreError>;

    /// Resets the slot counter to the number of rows actually holding a slot,
    /// correcting drift from a crash between `acquire_slot` and the
    /// subsequent status write. Returns the corrected count.
    async fn reconcile_slots(&self) -> Result<i64, JobStoreError>;
}
