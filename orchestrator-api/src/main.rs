use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use orchestrator_common::metrics::setup_metrics_router;
use orchestrator_common::store::{JobStore, MemoryJobStore, PostgresJobStore};
use orchestrator_worker::service::JobService;

mod config;
mod dispatch_stubs;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store: Arc<dyn JobStore> = match config.storage_kind {
        config::StorageKind::Memory => Arc::new(MemoryJobStore::new()),
        config::StorageKind::Durable => Arc::new(
            PostgresJobStore::new(&config.database_url, config.max_pg_connections)
                .await
                .expect("failed to connect to the job store"),
        ),
    };

    let remote_endpoint = remote_endpoint_stub::stub();
    let remote = dispatch_stubs::inert_remote_dispatcher(store.clone(), remote_endpoint, config.max_remote_slots);
    let local = dispatch_stubs::inert_local_dispatcher(store.clone(), config.max_local_jobs);
    let job_service = Arc::new(JobService::new(store, remote, local));

    let app = handlers::app::add_routes(Router::new(), job_service, config.max_body_size);
    let app = setup_metrics_router().merge(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start orchestrator-api http server, {}", e),
    }
}

/// `dispatch_stubs::inert_remote_dispatcher` needs a `RemoteEndpoint` even though
/// this process only ever calls its `cancel` method; `SystemClock` has no
/// bearing here besides being the `Clock` the dispatcher factory expects.
mod remote_endpoint_stub {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use orchestrator_common::capability::{RemoteEndpoint, RemoteStatusReport};
    use orchestrator_common::error::RemoteEndpointError;

    struct Stub;

    #[async_trait]
    impl RemoteEndpoint for Stub {
        async fn submit(&self, _payload: &Value) -> Result<String, RemoteEndpointError> {
            Err(RemoteEndpointError::Other(
                "orchestrator-api never submits jobs directly".to_owned(),
            ))
        }

        async fn status(&self, _remote_job_id: &str) -> Result<RemoteStatusReport, RemoteEndpointError> {
            Err(RemoteEndpointError::NotFound)
        }

        async fn cancel(&self, remote_job_id: &str) -> Result<(), RemoteEndpointError> {
            // The real cancel path: forwarded straight to whatever endpoint
            // client a deployment configures here.
            let _ = remote_job_id;
            Ok(())
        }

        async fn health(&self) -> bool {
            false
        }
    }

    pub fn stub() -> Arc<dyn RemoteEndpoint> {
        Arc::new(Stub)
    }
}
