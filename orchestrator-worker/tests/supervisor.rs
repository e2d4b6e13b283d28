use std::sync::Arc;
use std::time::Duration;

use orchestrator_common::capability::{RemoteState, RemoteStatusReport};
use orchestrator_common::job::{ErrorKind, JobStatus, NewJob, Operation};
use orchestrator_common::store::{JobStore, MemoryJobStore, Mutations};
use orchestrator_worker::delivery::{WebhookDeliverer, WebhookDelivererConfig};
use orchestrator_worker::local::LocalDispatcher;
use orchestrator_worker::remote::{RemoteDispatcher, RemoteDispatcherConfig};
use orchestrator_worker::supervisor::{Supervisor, SupervisorConfig};
use orchestrator_worker::testing::{ImmediateClock, ScriptedLocalExecutor, ScriptedRemoteEndpoint, ScriptedWebhookTransport};

fn remote_config() -> RemoteDispatcherConfig {
    RemoteDispatcherConfig {
        max_remote_slots: 4,
        poll_initial_delay: Duration::from_millis(1),
        poll_max_delay: Duration::from_millis(4),
        poll_backoff_factor: 2.0,
        max_poll_errors: 3,
        initial_grace_period: Duration::from_millis(50),
        fanout_threshold: 50,
        fanout_max_siblings: 3,
    }
}

async fn build_health_handle() -> health::HealthHandle {
    let registry = health::HealthRegistry::new("test");
    registry.register("supervisor".to_owned(), Duration::from_secs(60)).await
}

#[tokio::test]
async fn recover_resumes_polling_for_stranded_remote_job() {
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
    store.acquire_slot(&id, 4).await.unwrap();
    store
        .transition_status(
            &id,
            JobStatus::Queued,
            JobStatus::Submitted,
            Mutations {
                remote_job_id: Some(Some("remote-stranded".to_owned())),
                submitted_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    endpoint.push_status(
        "remote-stranded",
        Ok(RemoteStatusReport {
            state: RemoteState::Completed,
            output: Some(serde_json::json!({"done": true})),
            error: None,
            timings: None,
        }),
    );

    let clock = Arc::new(ImmediateClock);
    let remote_dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint.clone(), clock.clone(), remote_config());
    let local_dispatcher = LocalDispatcher::new(
        Arc::clone(&store),
        Arc::new(ScriptedLocalExecutor::immediate(Ok(serde_json::json!({})))),
        2,
    );
    let webhook_deliverer = WebhookDeliverer::new(
        Arc::clone(&store),
        Arc::new(ScriptedWebhookTransport::new()),
        WebhookDelivererConfig {
            max_attempts: 3,
            retry_delays: vec![Duration::from_millis(10)],
            secret: None,
            max_concurrent: 4,
        },
    );

    let supervisor = Supervisor::new(
        Arc::clone(&store),
        remote_dispatcher,
        local_dispatcher,
        webhook_deliverer,
        endpoint,
        clock,
        SupervisorConfig {
            tick_interval: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(3600),
            execution_timeout: Duration::from_secs(1800),
        },
        build_health_handle().await,
    );

    supervisor.recover().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job = store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn recover_requeues_stranded_local_job() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());

    let id = store
        .enqueue(NewJob {
            operation: Operation::CaptionLocal,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();
    store
        .transition_status(
            &id,
            JobStatus::Queued,
            JobStatus::Submitted,
            Mutations::default(),
        )
        .await
        .unwrap();
    store
        .transition_status(
            &id,
            JobStatus::Submitted,
            JobStatus::Processing,
            Mutations {
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    let clock = Arc::new(ImmediateClock);
    let remote_dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint.clone(), clock.clone(), remote_config());
    let local_dispatcher = LocalDispatcher::new(
        Arc::clone(&store),
        Arc::new(ScriptedLocalExecutor::immediate(Ok(serde_json::json!({})))),
        2,
    );
    let webhook_deliverer = WebhookDeliverer::new(
        Arc::clone(&store),
        Arc::new(ScriptedWebhookTransport::new()),
        WebhookDelivererConfig {
            max_attempts: 3,
            retry_delays: vec![Duration::from_millis(10)],
            secret: None,
            max_concurrent: 4,
        },
    );

    let supervisor = Supervisor::new(
        Arc::clone(&store),
        remote_dispatcher,
        local_dispatcher,
        webhook_deliverer,
        endpoint,
        clock,
        SupervisorConfig {
            tick_interval: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(3600),
            execution_timeout: Duration::from_secs(1800),
        },
        build_health_handle().await,
    );

    supervisor.recover().await.unwrap();

    // Stranded local jobs have no external lifecycle to resume against, so
    // recovery returns them to QUEUED to be re-run from scratch rather than
    // cancelling them outright (spec §4.1's RecoverWorkers contract).
    let job = store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn sweep_times_out_a_local_job_stuck_past_execution_timeout() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());

    let id = store
        .enqueue(NewJob {
            operation: Operation::TranscribeLocal,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();
    store
        .transition_status(&id, JobStatus::Queued, JobStatus::Submitted, Mutations::default())
        .await
        .unwrap();
    // Local jobs never set `submitted_at` — `LocalDispatcher` skips straight
    // from QUEUED to PROCESSING and only records `started_at`. The sweep must
    // still catch them on that field alone.
    let stale_start = chrono::Utc::now() - chrono::Duration::seconds(5);
    store
        .transition_status(
            &id,
            JobStatus::Submitted,
            JobStatus::Processing,
            Mutations {
                started_at: Some(stale_start),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    let clock = Arc::new(ImmediateClock);
    let remote_dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint.clone(), clock.clone(), remote_config());
    let local_dispatcher = LocalDispatcher::new(
        Arc::clone(&store),
        Arc::new(ScriptedLocalExecutor::immediate(Ok(serde_json::json!({})))),
        2,
    );
    let webhook_deliverer = WebhookDeliverer::new(
        Arc::clone(&store),
        Arc::new(ScriptedWebhookTransport::new()),
        WebhookDelivererConfig {
            max_attempts: 3,
            retry_delays: vec![Duration::from_millis(10)],
            secret: None,
            max_concurrent: 4,
        },
    );

    let supervisor = Supervisor::new(
        Arc::clone(&store),
        remote_dispatcher,
        local_dispatcher,
        webhook_deliverer,
        endpoint,
        clock,
        SupervisorConfig {
            tick_interval: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(3600),
            execution_timeout: Duration::from_millis(100),
        },
        build_health_handle().await,
    );

    supervisor.sweep_timeouts().await.unwrap();

    let job = store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert_eq!(job.error.unwrap().kind, ErrorKind::ExecutionTimeout);
}
