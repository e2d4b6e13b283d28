use std::sync::Arc;
use std::time::Duration;

use orchestrator_common::job::{JobStatus, NewJob, Operation};
use orchestrator_common::store::{JobStore, MemoryJobStore};
use orchestrator_worker::local::LocalDispatcher;
use orchestrator_worker::testing::ScriptedLocalExecutor;

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
async fn local_job_completes() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let executor = Arc::new(ScriptedLocalExecutor::immediate(Ok(serde_json::json!({"ok": true}))));
    let dispatcher = LocalDispatcher::new(Arc::clone(&store), executor, 2);

    let id = store
        .enqueue(NewJob {
            operation: Operation::CaptionLocal,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();

    let job = wait_until_terminal(&store, &id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["ok"], true);
}

#[tokio::test]
async fn local_job_bounded_by_pool_size() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let executor = Arc::new(ScriptedLocalExecutor::sleepy(
        Duration::from_millis(100),
        Ok(serde_json::json!({})),
        true,
    ));
    let dispatcher = LocalDispatcher::new(Arc::clone(&store), executor, 1);

    let mut ids = Vec::new();
    for _ in 0..2 {
        ids.push(
            store
                .enqueue(NewJob {
                    operation: Operation::AddAudioLocal,
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

    let processing = futures::future::join_all(ids.iter().map(|id| store.get(id)))
        .await
        .into_iter()
        .filter(|j| j.as_ref().unwrap().status == JobStatus::Processing)
        .count();
    assert_eq!(processing, 1, "only one local job should be running at a time with pool size 1");
}

#[tokio::test]
async fn cancel_flips_token_and_job_stays_cancelled() {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let executor = Arc::new(ScriptedLocalExecutor::sleepy(
        Duration::from_millis(200),
        Ok(serde_json::json!({"ignored": true})),
        false,
    ));
    let dispatcher = LocalDispatcher::new(Arc::clone(&store), executor, 1);

    let id = store
        .enqueue(NewJob {
            operation: Operation::ConcatenateLocal,
            payload: serde_json::json!({}),
            webhook_url: None,
            caller_ref: None,
        })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher.cancel(&id);

    let job = wait_until_terminal(&store, &id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
}
