//! A `JobStore` backed by a single PostgreSQL `jobs` table plus a
//! single-row slot counter table, in the manner of this workspace's original
//! `pgqueue` module: `FOR UPDATE SKIP LOCKED` for dequeue-shaped reads, plain
//! `UPDATE ... WHERE status = $expected` for guarded transitions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::JobStoreError;
use crate::job::{Job, JobError, JobId, JobStatus, NewJob, Operation, OperationClass, WebhookState};

use super::{JobStore, Mutations};

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| JobStoreError::Storage(error.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn remote_operations() -> Vec<&'static str> {
        vec![
            "caption",
            "img2vid",
            "addaudio",
            "concatenate",
            "caption_segments",
            "caption_highlight",
            "transcribe",
        ]
    }

    fn local_operations() -> Vec<&'static str> {
        vec![
            "caption_local",
            "img2vid_local",
            "addaudio_local",
            "concatenate_local",
            "caption_segments_local",
            "caption_highlight_local",
            "transcribe_local",
        ]
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
        let operation_str: String = row.try_get("operation").map_err(storage_err)?;
        let operation: Operation = operation_str
            .parse()
            .map_err(|_| JobStoreError::Storage(format!("corrupt operation column: {operation_str}")))?;

        let error_json: Option<Value> = row.try_get("error").map_err(storage_err)?;
        let error = error_json
            .map(serde_json::from_value::<JobError>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        let webhook_state_json: Value = row.try_get("webhook_state").map_err(storage_err)?;
        let webhook_state = serde_json::from_value::<WebhookState>(webhook_state_json)
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        Ok(Job {
            id: row.try_get("id").map_err(storage_err)?,
            operation,
            payload: row.try_get("payload").map_err(storage_err)?,
            webhook_url: row.try_get("webhook_url").map_err(storage_err)?,
            caller_ref: row.try_get("caller_ref").map_err(storage_err)?,
            status: row.try_get("status").map_err(storage_err)?,
            remote_job_id: row.try_get("remote_job_id").map_err(storage_err)?,
            attempts: {
                let attempts: i32 = row.try_get("attempts").map_err(storage_err)?;
                attempts as u32
            },
            result: row.try_get("result").map_err(storage_err)?,
            error,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            submitted_at: row.try_get("submitted_at").map_err(storage_err)?,
            started_at: row.try_get("started_at").map_err(storage_err)?,
            completed_at: row.try_get("completed_at").map_err(storage_err)?,
            webhook_state,
        })
    }
}

fn storage_err(error: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(error.to_string())
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (operation, payload, webhook_url, caller_ref, status, webhook_state)
            VALUES ($1, $2, $3, $4, 'queued', '{}'::jsonb)
            RETURNING id
            "#,
        )
        .bind(new_job.operation.as_str())
        .bind(&new_job.payload)
        .bind(&new_job.webhook_url)
        .bind(&new_job.caller_ref)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        row.try_get::<JobId, _>("id").map_err(storage_err)
    }

    async fn get_queued(
        &self,
        class: OperationClass,
        limit: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        let operations = match class {
            OperationClass::Remote => Self::remote_operations(),
            OperationClass::Local => Self::local_operations(),
        };

        // FOR UPDATE SKIP LOCKED so concurrent RemoteDispatcher/LocalDispatcher
        // instances fan out across the queue instead of contending on the same
        // rows. This is a read-only peek: it does not advance status itself,
        // leaving that to a subsequent transition_status call.
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'queued' AND operation = ANY($1)
            ORDER BY created_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(&operations[..])
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        Self::row_to_job(&row)
    }

    async fn transition_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        to: JobStatus,
        mutations: Mutations,
    ) -> Result<Job, JobStoreError> {
        // `remote_job_id` is tri-state (leave / clear / set): COALESCE can't
        // express "set this column to NULL", so it's driven off an explicit
        // "was this mutation present at all" flag instead.
        let (touch_remote_job_id, remote_job_id_value) = match mutations.remote_job_id {
            Some(value) => (true, value),
            None => (false, None),
        };

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = $3,
                attempts = attempts + CASE WHEN $2 = 'queued' THEN 1 ELSE 0 END,
                remote_job_id = CASE WHEN $4 THEN $5 ELSE remote_job_id END,
                result = COALESCE($6, result),
                error = COALESCE($7, error),
                submitted_at = COALESCE($8, submitted_at),
                started_at = COALESCE($9, started_at),
                completed_at = COALESCE($10, completed_at)
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(to)
        .bind(touch_remote_job_id)
        .bind(remote_job_id_value)
        .bind(&mutations.result)
        .bind(mutations.error.map(|e| serde_json::to_value(e).expect("JobError always serializes")))
        .bind(mutations.submitted_at)
        .bind(mutations.started_at)
        .bind(mutations.completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Self::row_to_job(&row),
            None => {
                // Either the row doesn't exist, or it exists but status didn't
                // match `expected`. Fetch the current status to report which.
                let current = self.get(id).await?;
                Err(JobStoreError::PreconditionFailed {
                    job_id: id.clone(),
                    expected,
                    actual: current.status,
                })
            }
        }
    }

    async fn acquire_slot(&self, job_id: &JobId, max: i64) -> Result<i64, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let already_held: Option<bool> = sqlx::query("SELECT holds_remote_slot FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .map(|row| row.try_get("holds_remote_slot"))
            .transpose()
            .map_err(storage_err)?;

        if already_held == Some(true) {
            let active: i64 = sqlx::query("SELECT active FROM remote_slot_counter")
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_err)?
                .try_get("active")
                .map_err(storage_err)?;
            tx.commit().await.map_err(storage_err)?;
            return Ok(active);
        }

        let row = sqlx::query(
            r#"
            UPDATE remote_slot_counter
            SET active = active + 1
            WHERE active < $1
            RETURNING active
            "#,
        )
        .bind(max)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let active = match row {
            Some(row) => row.try_get::<i64, _>("active").map_err(storage_err)?,
            None => {
                let active: i64 = sqlx::query("SELECT active FROM remote_slot_counter")
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(storage_err)?
                    .try_get("active")
                    .map_err(storage_err)?;
                return Err(JobStoreError::NoSlotsAvailable { active, max });
            }
        };

        sqlx::query("UPDATE jobs SET holds_remote_slot = true WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(active)
    }

    async fn release_slot(&self, job_id: &JobId) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let released = sqlx::query(
            "UPDATE jobs SET holds_remote_slot = false WHERE id = $1 AND holds_remote_slot RETURNING id",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .is_some();

        if released {
            sqlx::query("UPDATE remote_slot_counter SET active = active - 1")
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn active_slots(&self) -> Result<i64, JobStoreError> {
        let row = sqlx::query("SELECT active FROM remote_slot_counter")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        row.try_get("active").map_err(storage_err)
    }

    async fn list_active_remote(&self) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('submitted', 'processing') AND operation = ANY($1)",
        )
        .bind(&Self::remote_operations()[..])
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = $1")
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update_webhook_state(
        &self,
        id: &JobId,
        state: WebhookState,
    ) -> Result<(), JobStoreError> {
        let state_json =
            serde_json::to_value(state).map_err(|e| JobStoreError::Storage(e.to_string()))?;

        sqlx::query("UPDATE jobs SET webhook_state = $2 WHERE id = $1")
            .bind(id)
            .bind(state_json)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled', 'timed_out')
              AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn reconcile_slots(&self) -> Result<i64, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // `holds_remote_slot` is dispatcher-maintained and can drift from
        // `status` across a crash; resync it from the authoritative status
        // column before recomputing the counter from it.
        sqlx::query(
            r#"
            UPDATE jobs
            SET holds_remote_slot = (status IN ('submitted', 'processing'))
            WHERE operation = ANY($1)
            "#,
        )
        .bind(&Self::remote_operations()[..])
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let row = sqlx::query(
            r#"
            UPDATE remote_slot_counter
            SET active = (SELECT COUNT(*) FROM jobs WHERE holds_remote_slot)
            RETURNING active
            "#,
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        let active = row.try_get("active").map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(active)
    }
}
