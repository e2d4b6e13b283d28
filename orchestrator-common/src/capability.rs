//! The narrow capability interfaces the core depends on. Real implementations
//! of `RemoteEndpoint` and `LocalExecutor` live outside this workspace's
//! scope (the remote GPU protocol and the media transforms themselves);
//! `WebhookTransport` and `Clock` are infrastructure the core legitimately
//! owns, so real implementations ship here alongside the traits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteEndpointError, WebhookTransportError};
use crate::job::Operation;

/// The state a remote job can be in, as reported by `RemoteEndpoint::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RemoteStatusReport {
    pub state: RemoteState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub timings: Option<Value>,
}

/// The remote GPU serverless endpoint. Submission, polling and cancellation
/// are the only operations the core needs; everything about how the endpoint
/// itself runs a job is outside this crate's concern.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn submit(&self, payload: &Value) -> Result<String, RemoteEndpointError>;
    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatusReport, RemoteEndpointError>;
    async fn cancel(&self, remote_job_id: &str) -> Result<(), RemoteEndpointError>;
    async fn health(&self) -> bool;
}

/// The local media transform capability. `cancel` is a one-shot signal the
/// executor should observe at reasonable granularity; if it is ignored, the
/// job is still marked `CANCELLED` once `run` returns.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn run(
        &self,
        operation: Operation,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value, String>;
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP delivery for webhook payloads. Kept as a trait (rather than calling
/// `reqwest` directly from `WebhookDeliverer`) so delivery can be faked in
/// tests without a real network.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<WebhookResponse, WebhookTransportError>;
}

/// All time-dependent code in the core goes through `Clock`, so tests can
/// supply a fake that advances on demand instead of sleeping in wall time.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// A signal that elapses after `duration`, suitable for racing against
    /// other signals in a `tokio::select!`.
    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// The real `Clock`, backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// The real `WebhookTransport`, backed by `reqwest`.
pub struct ReqwestWebhookTransport {
    client: reqwest::Client,
}

impl ReqwestWebhookTransport {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("media-orchestrator-webhook")
            .build()
            .expect("failed to construct reqwest client for webhook transport");

        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for ReqwestWebhookTransport {
    async fn post(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<WebhookResponse, WebhookTransportError> {
        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|error| WebhookTransportError::Request(error.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| WebhookTransportError::Request(error.to_string()))?;

        Ok(WebhookResponse { status, body })
    }
}
