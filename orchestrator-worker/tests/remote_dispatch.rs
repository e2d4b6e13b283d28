use std::sync::Arc;
use std::time::Duration;

use orchestrator_common::capability::{RemoteState, RemoteStatusReport};
use orchestrator_common::error::RemoteEndpointError;
use orchestrator_common::job::{JobStatus, NewJob, Operation};
use orchestrator_common::store::{JobStore, MemoryJobStore};
use orchestrator_worker::remote::{RemoteDispatcher, RemoteDispatcherConfig};
use orchestrator_worker::testing::{ImmediateClock, ScriptedRemoteEndpoint};

fn config() -> RemoteDispatcherConfig {
    RemoteDispatcherConfig {
        max_remote_slots: 2,
        poll_initial_delay: Duration::from_millis(1),
        poll_max_delay: Duration::from_millis(4),
        poll_backoff_factor: 2.0,
        max_poll_errors: 3,
        initial_grace_period: Duration::from_millis(50),
        fanout_threshold: 50,
        fanout_max_siblings: 3,
    }
}

async fn wait_until_terminal(store: &Arc<dyn JobStore>, id: &str) -> orchestrator_common::job::Job {
    for _ in 0..200 {
        let job = store.get(&id.to_owned()).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached a terminal state");
}

#[tokio::test]
async fn happy_path_completes_and_releases_slot() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    endpoint.push_submission(Ok("remote-1".to_owned()));
    endpoint.push_status(
        "remote-1",
        Ok(RemoteStatusReport {
            state: RemoteState::InProgress,
            output: None,
            error: None,
            timings: None,
        }),
    );
    endpoint.push_status(
        "remote-1",
        Ok(RemoteStatusReport {
            state: RemoteState::Completed,
            output: Some(serde_json::json!({"url": "s3://done"})),
            error: None,
            timings: None,
        }),
    );

    let clock = Arc::new(ImmediateClock);
    let dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint, clock, config());

    let id = store
        .enqueue(NewJob {
            operation: Operation::Caption,
            payload: serde_json::json!({"subunits": []}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();

    let job = wait_until_terminal(&store, &id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["url"], "s3://done");
    assert_eq!(store.active_slots().await.unwrap(), 0);
}

#[tokio::test]
async fn slot_cap_holds_back_excess_jobs() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    for _ in 0..3 {
        endpoint.push_submission(Ok("remote".to_owned()));
    }
    endpoint.push_status(
        "remote",
        Ok(RemoteStatusReport {
            state: RemoteState::InProgress,
            output: None,
            error: None,
            timings: None,
        }),
    );

    let mut cfg = config();
    cfg.max_remote_slots = 1;
    let clock = Arc::new(ImmediateClock);
    let dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint, clock, cfg);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            store
                .enqueue(NewJob {
                    operation: Operation::Caption,
                    payload: serde_json::json!({}),
                    webhook_url: None,
                    caller_ref: None,
                })
                .await
                .unwrap(),
        );
    }

    dispatcher.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.active_slots().await.unwrap() <= 1);

    let statuses: Vec<_> = futures::future::join_all(ids.iter().map(|id| store.get(id)))
        .await
        .into_iter()
        .map(|j| j.unwrap().status)
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == JobStatus::Submitted).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == JobStatus::Queued).count(), 2);
}

#[tokio::test]
async fn vanished_job_fails_after_grace_period() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    endpoint.push_submission(Ok("remote-gone".to_owned()));
    endpoint.push_status("remote-gone", Err(RemoteEndpointError::NotFound));

    let mut cfg = config();
    cfg.initial_grace_period = Duration::from_millis(0);
    let clock = Arc::new(ImmediateClock);
    let dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint, clock, cfg);

    let id = store
        .enqueue(NewJob {
            operation: Operation::Transcribe,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();

    let job = wait_until_terminal(&store, &id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, orchestrator_common::job::ErrorKind::Vanished);
}

#[tokio::test]
async fn cancel_before_remote_terminal_flips_to_cancelled() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let endpoint = Arc::new(ScriptedRemoteEndpoint::new());
    endpoint.push_submission(Ok("remote-cancel".to_owned()));
    endpoint.push_status(
        "remote-cancel",
        Ok(RemoteStatusReport {
            state: RemoteState::InQueue,
            output: None,
            error: None,
            timings: None,
        }),
    );

    let clock = Arc::new(ImmediateClock);
    let dispatcher = RemoteDispatcher::new(Arc::clone(&store), endpoint.clone(), clock, config());

    let id = store
        .enqueue(NewJob {
            operation: Operation::Img2Vid,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job = store.get(&id).await.unwrap();
    dispatcher.cancel(&job).await.unwrap();

    let job = store.get(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(store.active_slots().await.unwrap(), 0);
}
