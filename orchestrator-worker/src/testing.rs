//! In-memory fakes for the four Capability traits, used by this crate's
//! `tests/` integration suites so the dispatch logic can be exercised
//! without a real network or Postgres, since none of this crate's logic is
//! store-implementation specific.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use orchestrator_common::capability::{
    Clock, LocalExecutor, RemoteEndpoint, RemoteStatusReport, WebhookResponse, WebhookTransport,
};
use orchestrator_common::error::{RemoteEndpointError, WebhookTransportError};
use orchestrator_common::job::Operation;

/// A scripted sequence of `RemoteStatusReport`s returned for a given
/// `remote_job_id`, one per call to `status`; the last entry repeats once
/// exhausted.
pub struct ScriptedRemoteEndpoint {
    submissions: Mutex<VecDeque<Result<String, RemoteEndpointError>>>,
    scripts: Mutex<std::collections::HashMap<String, VecDeque<Result<RemoteStatusReport, RemoteEndpointError>>>>,
    cancellations: Mutex<Vec<String>>,
}

impl Default for ScriptedRemoteEndpoint {
    fn default() -> Self {
        Self {
            submissions: Mutex::new(VecDeque::new()),
            scripts: Mutex::new(std::collections::HashMap::new()),
            cancellations: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRemoteEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submission(&self, result: Result<String, RemoteEndpointError>) {
        self.submissions.lock().unwrap().push_back(result);
    }

    pub fn push_status(&self, remote_job_id: &str, result: Result<RemoteStatusReport, RemoteEndpointError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(remote_job_id.to_owned())
            .or_default()
            .push_back(result);
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedRemoteEndpoint {
    async fn submit(&self, _payload: &Value) -> Result<String, RemoteEndpointError> {
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("R-default".to_owned()))
    }

    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatusReport, RemoteEndpointError> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(remote_job_id.to_owned()).or_default();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(RemoteEndpointError::NotFound))
        }
    }

    async fn cancel(&self, remote_job_id: &str) -> Result<(), RemoteEndpointError> {
        self.cancellations.lock().unwrap().push(remote_job_id.to_owned());
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}

/// A `LocalExecutor` fake that runs a closure-free scripted outcome: either
/// returns immediately, or sleeps for a fixed duration first (to exercise
/// the execution-timeout path), optionally ignoring its cancel signal.
pub struct ScriptedLocalExecutor {
    pub delay: Option<Duration>,
    pub outcome: Mutex<Option<Result<Value, String>>>,
    pub ignore_cancel: bool,
}

impl ScriptedLocalExecutor {
    pub fn immediate(outcome: Result<Value, String>) -> Self {
        Self {
            delay: None,
            outcome: Mutex::new(Some(outcome)),
            ignore_cancel: false,
        }
    }

    pub fn sleepy(delay: Duration, outcome: Result<Value, String>, ignore_cancel: bool) -> Self {
        Self {
            delay: Some(delay),
            outcome: Mutex::new(Some(outcome)),
            ignore_cancel,
        }
    }
}

#[async_trait]
impl LocalExecutor for ScriptedLocalExecutor {
    async fn run(&self, _operation: Operation, _payload: Value, cancel: CancellationToken) -> Result<Value, String> {
        if let Some(delay) = self.delay {
            if self.ignore_cancel {
                tokio::time::sleep(delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err("cancelled".to_owned()),
                }
            }
        }

        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err("executor fake exhausted".to_owned()))
    }
}

/// A `WebhookTransport` fake returning a scripted sequence of responses, one
/// per call, recording every request it received.
pub struct ScriptedWebhookTransport {
    responses: Mutex<VecDeque<Result<WebhookResponse, WebhookTransportError>>>,
    received: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Default for ScriptedWebhookTransport {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedWebhookTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: u16) {
        self.responses.lock().unwrap().push_back(Ok(WebhookResponse {
            status,
            body: String::new(),
        }));
    }

    pub fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedWebhookTransport {
    async fn post(
        &self,
        url: &str,
        _headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<WebhookResponse, WebhookTransportError> {
        self.received.lock().unwrap().push((url.to_owned(), body));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(WebhookResponse { status: 200, body: String::new() }))
    }
}

/// A manually-advanced `Clock`, so tests don't sleep in wall time. `sleep`
/// and `after` resolve immediately; tests instead assert ordering and
/// counts, not wall-clock durations.
#[derive(Default)]
pub struct ImmediateClock;

#[async_trait]
impl Clock for ImmediateClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, _duration: Duration) {}

    fn after(&self, _duration: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}
