use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use orchestrator_common::job::{Job, JobId, NewJob, Operation};
use orchestrator_common::webhook;
use orchestrator_worker::error::JobServiceError;
use orchestrator_worker::service::JobService;

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub operation: Operation,
    pub payload: Value,
    pub webhook_url: Option<String>,
    pub caller_ref: Option<Value>,
}

/// `POST /jobs`. Re-validates `webhook_url` at ingress time (the same check
/// `WebhookDeliverer` re-applies just before sending) so obviously-bad URLs
/// are rejected immediately rather than silently never delivering.
pub async fn enqueue(
    State(service): State<Arc<JobService>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<JobId>, StatusCode> {
    if let Some(url) = &request.webhook_url {
        webhook::validate_url(url).map_err(|_| StatusCode::BAD_REQUEST)?;
    }

    let id = service
        .enqueue(NewJob {
            operation: request.operation,
            payload: request.payload,
            webhook_url: request.webhook_url,
            caller_ref: request.caller_ref,
        })
        .await
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    Ok(Json(id))
}

/// `GET /jobs/:id`.
pub async fn get_job(
    State(service): State<Arc<JobService>>,
    Path(id): Path<JobId>,
) -> Result<Json<Job>, StatusCode> {
    service.get(&id).await.map(Json).map_err(|_| StatusCode::NOT_FOUND)
}

/// `POST /jobs/:id/cancel`. `202 Accepted` since cancellation is asynchronous:
/// the job may still be observed as non-terminal for a short window after
/// this call returns. `404` for an unknown job, `409` if it's already
/// terminal.
pub async fn cancel(State(service): State<Arc<JobService>>, Path(id): Path<JobId>) -> StatusCode {
    match service.cancel(&id).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(JobServiceError::UnknownJob(_)) => StatusCode::NOT_FOUND,
        Err(JobServiceError::AlreadyTerminal(_)) => StatusCode::CONFLICT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_common::job::{new_job_id, JobStatus};
    use orchestrator_common::store::{JobStore, MemoryJobStore, Mutations};

    use crate::dispatch_stubs::{inert_local_dispatcher, inert_remote_dispatcher};

    fn service(store: Arc<dyn JobStore>) -> Arc<JobService> {
        let remote_endpoint = Arc::new(orchestrator_worker::testing::ScriptedRemoteEndpoint::new());
        let remote = inert_remote_dispatcher(store.clone(), remote_endpoint, 4);
        let local = inert_local_dispatcher(store.clone(), 2);
        Arc::new(JobService::new(store, remote, local))
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let service = service(store);

        let status = cancel(State(service), Path(new_job_id())).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_conflict() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = store
            .enqueue(NewJob {
                operation: Operation::Caption,
                payload: serde_json::json!({}),
                webhook_url: None,
                caller_ref: None,
            })
            .await
            .unwrap();
        store
            .transition_status(&id, JobStatus::Queued, JobStatus::Cancelled, Mutations::default())
            .await
            .unwrap();
        let service = service(store);

        let status = cancel(State(service), Path(id)).await;

        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cancel_queued_job_is_accepted() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = store
            .enqueue(NewJob {
                operation: Operation::Caption,
                payload: serde_json::json!({}),
                webhook_url: None,
                caller_ref: None,
            })
            .await
            .unwrap();
        let service = service(store.clone());

        let status = cancel(State(service), Path(id.clone())).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Cancelled);
    }
}
