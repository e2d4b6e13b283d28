use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use health::HealthRegistry;

use orchestrator_common::capability::{Clock, ReqwestWebhookTransport, SystemClock};
use orchestrator_common::metrics::{serve, setup_metrics_router};
use orchestrator_common::store::{JobStore, MemoryJobStore, PostgresJobStore};

use orchestrator_worker::config::{Config, StorageKind};
use orchestrator_worker::delivery::{WebhookDeliverer, WebhookDelivererConfig};
use orchestrator_worker::error::WorkerError;
use orchestrator_worker::local::LocalDispatcher;
use orchestrator_worker::remote::{RemoteDispatcher, RemoteDispatcherConfig};
use orchestrator_worker::supervisor::{Supervisor, SupervisorConfig};

/// Runs the background core: the two dispatchers, the webhook deliverer and
/// the Supervisor that drives all three. Ingress (`POST /jobs` and friends)
/// is a separate process, `orchestrator-api`, that talks to the same
/// `JobStore` through `JobService` — this binary only exposes `/metrics` and
/// the health probes.
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let supervisor_liveness = liveness
        .register("supervisor".to_string(), config.lease_duration())
        .await;

    let store: Arc<dyn JobStore> = match config.storage_kind {
        StorageKind::Memory => Arc::new(MemoryJobStore::new()),
        StorageKind::Durable => {
            Arc::new(PostgresJobStore::new(&config.database_url, config.max_pg_connections).await?)
        }
    };

    // Neither the remote GPU endpoint nor the media-transform executor has a
    // concrete implementation in this workspace; a deployment wires one in
    // through these same Capability traits. Until then the dispatchers are
    // live but every submission/run call fails closed.
    let remote_endpoint = no_capability::remote_endpoint();
    let local_executor = no_capability::local_executor();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let remote_dispatcher = RemoteDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&remote_endpoint),
        Arc::clone(&clock),
        RemoteDispatcherConfig {
            max_remote_slots: config.max_remote_slots,
            poll_initial_delay: config.poll_initial_delay.0,
            poll_max_delay: config.poll_max_delay.0,
            poll_backoff_factor: config.poll_backoff_factor,
            max_poll_errors: config.max_poll_errors,
            initial_grace_period: config.initial_grace_period.0,
            fanout_threshold: config.fanout_threshold,
            fanout_max_siblings: config.fanout_max_siblings,
        },
    );

    let local_dispatcher = LocalDispatcher::new(Arc::clone(&store), local_executor, config.max_local_jobs);

    let webhook_transport = Arc::new(ReqwestWebhookTransport::new(config.webhook.request_timeout.0));
    let webhook_deliverer = WebhookDeliverer::new(
        Arc::clone(&store),
        webhook_transport,
        WebhookDelivererConfig {
            max_attempts: config.webhook.max_attempts,
            retry_delays: config.webhook.retry_delays.0.clone(),
            secret: config.webhook.secret.clone(),
            max_concurrent: config.webhook.max_concurrent,
        },
    );

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        remote_dispatcher,
        local_dispatcher,
        webhook_deliverer,
        remote_endpoint,
        clock,
        SupervisorConfig {
            tick_interval: config.tick_interval.0,
            timeout_check_interval: config.timeout_check_interval.0,
            queue_timeout: config.queue_timeout.0,
            execution_timeout: config.execution_timeout.0,
        },
        supervisor_liveness,
    ));

    supervisor
        .recover()
        .await
        .map_err(|error| WorkerError::Config(format!("failed to recover stranded jobs at startup: {error}")))?;

    let router = Router::new()
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_router().merge(router);

    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind).await.expect("failed to start serving metrics");
    });

    supervisor.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "media orchestrator worker"
}

/// Stand-in Capability implementations for the externally-owned protocols
/// this workspace depends on but does not itself implement.
mod no_capability {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use orchestrator_common::capability::{LocalExecutor, RemoteEndpoint, RemoteStatusReport};
    use orchestrator_common::error::RemoteEndpointError;
    use orchestrator_common::job::Operation;

    struct Unconfigured;

    #[async_trait]
    impl RemoteEndpoint for Unconfigured {
        async fn submit(&self, _payload: &Value) -> Result<String, RemoteEndpointError> {
            Err(RemoteEndpointError::Other(
                "no remote endpoint configured for this deployment".to_owned(),
            ))
        }

        async fn status(&self, _remote_job_id: &str) -> Result<RemoteStatusReport, RemoteEndpointError> {
            Err(RemoteEndpointError::NotFound)
        }

        async fn cancel(&self, _remote_job_id: &str) -> Result<(), RemoteEndpointError> {
            Ok(())
        }

        async fn health(&self) -> bool {
            false
        }
    }

    #[async_trait]
    impl LocalExecutor for Unconfigured {
        async fn run(&self, _operation: Operation, _payload: Value, _cancel: CancellationToken) -> Result<Value, String> {
            Err("no local executor configured for this deployment".to_owned())
        }
    }

    pub fn remote_endpoint() -> Arc<dyn RemoteEndpoint> {
        Arc::new(Unconfigured)
    }

    pub fn local_executor() -> Arc<dyn LocalExecutor> {
        Arc::new(Unconfigured)
    }
}
