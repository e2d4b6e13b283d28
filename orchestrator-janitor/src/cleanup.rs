//! The periodic retention sweep: deletes terminal jobs older than `jobTTL`
//! from the durable `JobStore`. A `Semaphore::new(1)`-guarded
//! `tokio::time::interval` loop ensures sweeps never overlap even if one
//! runs long.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use orchestrator_common::store::JobStore;

pub struct PruneSweeper {
    store: Arc<dyn JobStore>,
    job_ttl: Duration,
}

impl PruneSweeper {
    pub fn new(store: Arc<dyn JobStore>, job_ttl: Duration) -> Self {
        Self { store, job_ttl }
    }

    async fn sweep(&self) {
        let older_than = Utc::now() - chrono::Duration::from_std(self.job_ttl).unwrap_or_default();
        match self.store.prune(older_than).await {
            Ok(pruned) => {
                metrics::counter!("orchestrator_janitor_jobs_pruned_total").increment(pruned);
                info!(pruned, %older_than, "pruned terminal jobs past jobTTL");
            }
            Err(error) => {
                warn!(%error, "prune sweep failed");
            }
        }
    }

    /// Runs forever, one sweep per `cleanup_interval` tick, never more than
    /// one sweep in flight at a time.
    pub async fn run(self, interval: Duration) {
        let semaphore = Semaphore::new(1);
        let mut ticker = tokio::time::interval(interval);

        loop {
            let _permit = semaphore.acquire().await;
            ticker.tick().await;
            self.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_common::job::{JobStatus, NewJob, Operation};
    use orchestrator_common::store::{MemoryJobStore, Mutations};

    #[tokio::test]
    async fn sweep_deletes_only_jobs_past_ttl() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());

        let stale = store
            .enqueue(NewJob {
                operation: Operation::Caption,
                payload: serde_json::json!({}),
                webhook_url: None,
                caller_ref: None,
            })
            .await
            .unwrap();
        store
            .transition_status(
                &stale,
                JobStatus::Queued,
                JobStatus::Cancelled,
                Mutations {
                    completed_at: Some(Utc::now() - chrono::Duration::days(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fresh = store
            .enqueue(NewJob {
                operation: Operation::Caption,
                payload: serde_json::json!({}),
                webhook_url: None,
                caller_ref: None,
            })
            .await
            .unwrap();
        store
            .transition_status(
                &fresh,
                JobStatus::Queued,
                JobStatus::Cancelled,
                Mutations {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sweeper = PruneSweeper::new(Arc::clone(&store), Duration::from_secs(3600 * 24));
        sweeper.sweep().await;

        assert!(store.get(&stale).await.is_err());
        assert!(store.get(&fresh).await.is_ok());
    }
}
