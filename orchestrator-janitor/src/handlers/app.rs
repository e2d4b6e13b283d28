use axum::{routing, Router};

pub fn app() -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
}

pub async fn index() -> &'static str {
    "media orchestrator janitor"
}
