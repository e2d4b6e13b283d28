//! The core data model: `Job`, its status state machine, and the closed set
//! of operations the orchestrator routes between the remote and local
//! dispatchers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a job. Generated at enqueue time, never reused.
pub type JobId = String;

pub fn new_job_id() -> JobId {
    Uuid::now_v7().to_string()
}

/// The closed set of operations a job may request. Every remote operation has
/// a local twin with a `_local` suffix and an identical payload schema; the
/// suffix is what routes a job to the `LocalDispatcher` instead of the
/// `RemoteDispatcher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Caption,
    CaptionLocal,
    Img2Vid,
    Img2VidLocal,
    AddAudio,
    AddAudioLocal,
    Concatenate,
    ConcatenateLocal,
    CaptionSegments,
    CaptionSegmentsLocal,
    CaptionHighlight,
    CaptionHighlightLocal,
    Transcribe,
    TranscribeLocal,
}

/// The partition operations fall into. Determines which dispatcher owns a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Remote,
    Local,
}

impl Operation {
    /// All operations in the given class, for `JobStore::get_queued` filters.
    pub const fn class(self) -> OperationClass {
        match self {
            Operation::Caption
            | Operation::Img2Vid
            | Operation::AddAudio
            | Operation::Concatenate
            | Operation::CaptionSegments
            | Operation::CaptionHighlight
            | Operation::Transcribe => OperationClass::Remote,
            Operation::CaptionLocal
            | Operation::Img2VidLocal
            | Operation::AddAudioLocal
            | Operation::ConcatenateLocal
            | Operation::CaptionSegmentsLocal
            | Operation::CaptionHighlightLocal
            | Operation::TranscribeLocal => OperationClass::Local,
        }
    }

    /// The operation name with any local suffix stripped, as required in the
    /// webhook payload's `operation` field.
    pub const fn base_name(self) -> &'static str {
        match self {
            Operation::Caption | Operation::CaptionLocal => "caption",
            Operation::Img2Vid | Operation::Img2VidLocal => "img2vid",
            Operation::AddAudio | Operation::AddAudioLocal => "addaudio",
            Operation::Concatenate | Operation::ConcatenateLocal => "concatenate",
            Operation::CaptionSegments | Operation::CaptionSegmentsLocal => "caption_segments",
            Operation::CaptionHighlight | Operation::CaptionHighlightLocal => "caption_highlight",
            Operation::Transcribe | Operation::TranscribeLocal => "transcribe",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Caption => "caption",
            Operation::CaptionLocal => "caption_local",
            Operation::Img2Vid => "img2vid",
            Operation::Img2VidLocal => "img2vid_local",
            Operation::AddAudio => "addaudio",
            Operation::AddAudioLocal => "addaudio_local",
            Operation::Concatenate => "concatenate",
            Operation::ConcatenateLocal => "concatenate_local",
            Operation::CaptionSegments => "caption_segments",
            Operation::CaptionSegmentsLocal => "caption_segments_local",
            Operation::CaptionHighlight => "caption_highlight",
            Operation::CaptionHighlightLocal => "caption_highlight_local",
            Operation::Transcribe => "transcribe",
            Operation::TranscribeLocal => "transcribe_local",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid operation")]
pub struct ParseOperationError(String);

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caption" => Ok(Operation::Caption),
            "caption_local" => Ok(Operation::CaptionLocal),
            "img2vid" => Ok(Operation::Img2Vid),
            "img2vid_local" => Ok(Operation::Img2VidLocal),
            "addaudio" => Ok(Operation::AddAudio),
            "addaudio_local" => Ok(Operation::AddAudioLocal),
            "concatenate" => Ok(Operation::Concatenate),
            "concatenate_local" => Ok(Operation::ConcatenateLocal),
            "caption_segments" => Ok(Operation::CaptionSegments),
            "caption_segments_local" => Ok(Operation::CaptionSegmentsLocal),
            "caption_highlight" => Ok(Operation::CaptionHighlight),
            "caption_highlight_local" => Ok(Operation::CaptionHighlightLocal),
            "transcribe" => Ok(Operation::Transcribe),
            "transcribe_local" => Ok(Operation::TranscribeLocal),
            invalid => Err(ParseOperationError(invalid.to_owned())),
        }
    }
}

/// The job lifecycle. Transitions are enforced solely by `JobStore::transition_status`;
/// nothing else is permitted to mutate this field.
///
/// ```text
/// QUEUED ──► SUBMITTED ──► PROCESSING ──► COMPLETED
///    │           │              │      └► FAILED
///    │           │              └──────► TIMED_OUT
///    │           └────────────────────► FAILED
///    └────► CANCELLED (only from QUEUED, SUBMITTED, or PROCESSING)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Submitted,
    Processing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// Whether `to` is a legal transition target from `self`, per the diagram
    /// above. `Queued -> Processing` is the local-dispatch shortcut described
    /// in spec §4.3: local jobs have no broker to be `Submitted` to.
    pub const fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Queued, Submitted | Processing | Cancelled) => true,
            (Submitted, Processing | Failed | Cancelled) => true,
            (Processing, Completed | Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

/// Error kinds surfaced on a job's `error` field or as a typed dispatcher failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SubmitFailed,
    PollError,
    Vanished,
    ExecutorError,
    Cancelled,
    QueueTimeout,
    ExecutionTimeout,
    PartialFailure,
    WebhookDeliveryExhausted,
    SlotLeak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Delivery bookkeeping for a job's webhook, mutated only by the `WebhookDeliverer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookState {
    pub attempts_made: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered: bool,
}

/// A job as persisted by the `JobStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub webhook_url: Option<String>,
    pub caller_ref: Option<serde_json::Value>,
    pub status: JobStatus,
    pub remote_job_id: Option<String>,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub webhook_state: WebhookState,
}

impl Job {
    pub fn holds_remote_slot(&self) -> bool {
        matches!(self.status, JobStatus::Submitted | JobStatus::Processing)
    }
}

/// The fields a caller supplies to enqueue a new job. `JobStore::enqueue` fills
/// in `id`, `status`, `created_at` and the rest of the zeroed bookkeeping.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub webhook_url: Option<String>,
    pub caller_ref: Option<serde_json::Value>,
}
