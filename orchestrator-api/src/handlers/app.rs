use std::sync::Arc;

use axum::{routing, Router};
use tower_http::limit::RequestBodyLimitLayer;

use orchestrator_worker::service::JobService;

use super::jobs;

pub fn add_routes(router: Router, job_service: Arc<JobService>, max_body_size: usize) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/jobs",
            routing::post(jobs::enqueue)
                .with_state(job_service.clone())
                .layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route("/jobs/:id", routing::get(jobs::get_job).with_state(job_service.clone()))
        .route("/jobs/:id/cancel", routing::post(jobs::cancel).with_state(job_service))
}

pub async fn index() -> &'static str {
    "media orchestrator api"
}
