use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};

use orchestrator_common::metrics::setup_metrics_router;
use orchestrator_common::store::PostgresJobStore;

use cleanup::PruneSweeper;

mod cleanup;
mod config;
mod handlers;

/// Retention-only sibling process to `orchestrator-worker`: ticks `Prune`
/// against the durable store on `cleanupInterval`, reports how many rows it
/// removed, and exposes the same trivial health probes the other two
/// binaries do. Carries no dispatch logic of its own — the in-memory store
/// has no persistence to reclaim, so this process only makes sense alongside
/// `storageKind = durable`.
async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Arc::new(
        PostgresJobStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to connect to the job store"),
    );

    let sweeper = PruneSweeper::new(store, config.job_ttl.0);
    let cleanup_loop = Box::pin(sweeper.run(config.cleanup_interval.0));

    let app = setup_metrics_router().merge(handlers::app::app());
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start orchestrator-janitor http server, {}", e),
        },
        Either::Right(((), _)) => {
            tracing::error!("orchestrator-janitor cleanup task exited")
        }
    };
}
