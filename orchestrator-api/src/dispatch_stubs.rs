//! Inert dispatcher instances for the ingress process: `JobService` needs a
//! `RemoteDispatcher`/`LocalDispatcher` handle to route `cancel` calls
//! through, but this process never ticks either one. Real-endpoint remote
//! cancellation still works (`RemoteDispatcher::cancel` calls the endpoint
//! directly); local cancellation degrades to a no-op here since the signal
//! lives only in whichever `orchestrator-worker` process actually ran the
//! job — the Supervisor's timeout sweep is the backstop for that case.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use orchestrator_common::capability::{Clock, LocalExecutor, RemoteEndpoint, SystemClock};
use orchestrator_common::job::Operation;
use orchestrator_common::store::JobStore;
use orchestrator_worker::local::LocalDispatcher;
use orchestrator_worker::remote::{RemoteDispatcher, RemoteDispatcherConfig};

struct UnreachableLocalExecutor;

#[async_trait]
impl LocalExecutor for UnreachableLocalExecutor {
    async fn run(&self, _operation: Operation, _payload: Value, _cancel: CancellationToken) -> Result<Value, String> {
        Err("orchestrator-api never runs local jobs directly".to_owned())
    }
}

pub fn inert_remote_dispatcher(
    store: Arc<dyn JobStore>,
    remote_endpoint: Arc<dyn RemoteEndpoint>,
    max_remote_slots: i64,
) -> Arc<RemoteDispatcher> {
    RemoteDispatcher::new(
        store,
        remote_endpoint,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        RemoteDispatcherConfig {
            max_remote_slots,
            poll_initial_delay: Duration::from_secs(1),
            poll_max_delay: Duration::from_secs(1),
            poll_backoff_factor: 1.0,
            max_poll_errors: 1,
            initial_grace_period: Duration::ZERO,
            fanout_threshold: usize::MAX,
            fanout_max_siblings: 1,
        },
    )
}

pub fn inert_local_dispatcher(store: Arc<dyn JobStore>, max_local_jobs: usize) -> Arc<LocalDispatcher> {
    LocalDispatcher::new(store, Arc::new(UnreachableLocalExecutor), max_local_jobs)
}
