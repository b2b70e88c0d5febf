//! Data models for the offline sync queue.
//!
//! Defines jobs, statuses, kinds, error classes, media blobs and the
//! query/statistics types exchanged with the job store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Processing,
    Synced,          // terminal
    FailedRetryable,
    FailedTerminal, // terminal
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Synced,
        JobStatus::FailedRetryable,
        JobStatus::FailedTerminal,
    ];

    /// Returns true if this is a terminal state (Synced or FailedTerminal).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Synced | JobStatus::FailedTerminal)
    }

    /// Statuses the storage cleanup is never allowed to remove.
    pub fn is_protected(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Synced => "SYNCED",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "PROCESSING" => Some(JobStatus::Processing),
            "SYNCED" => Some(JobStatus::Synced),
            "FAILED_RETRYABLE" => Some(JobStatus::FailedRetryable),
            "FAILED_TERMINAL" => Some(JobStatus::FailedTerminal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Synced => "synced",
            JobStatus::FailedRetryable => "failed-retryable",
            JobStatus::FailedTerminal => "failed-terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s || status.as_db_str() == s)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which remote operation a job represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobKind {
    SubmitWork,
    SubmitApproval,
    Custom(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            JobKind::SubmitWork => "submit-work",
            JobKind::SubmitApproval => "submit-approval",
            JobKind::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "submit-work" => JobKind::SubmitWork,
            "submit-approval" => JobKind::SubmitApproval,
            other => JobKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        JobKind::parse(&value)
    }
}

impl From<JobKind> for String {
    fn from(kind: JobKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of error recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorType {
    Validation, // Payload rejected by business rules - NO retry
    Transport,  // Network/availability error - retry
    Timeout,    // Remote call exceeded its timeout - retry
    Rejected,   // Remote logic refused the operation - NO retry
}

impl JobErrorType {
    /// Returns true if this error type should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobErrorType::Transport | JobErrorType::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorType::Validation => "validation",
            JobErrorType::Transport => "transport",
            JobErrorType::Timeout => "timeout",
            JobErrorType::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(JobErrorType::Validation),
            "transport" => Some(JobErrorType::Transport),
            "timeout" => Some(JobErrorType::Timeout),
            "rejected" => Some(JobErrorType::Rejected),
            _ => None,
        }
    }
}

/// Error details stored on a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub error_type: JobErrorType,
    pub message: String,
}

impl JobError {
    pub fn new(error_type: JobErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_type.is_retryable()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type.as_str(), self.message)
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// Unique identifier (UUID)
    pub id: String,
    pub kind: JobKind,
    /// Domain data sent to the execution client, immutable once stored
    pub payload: Value,
    pub status: JobStatus,
    /// Number of dispatch attempts made so far, never decreases
    pub attempt_count: u32,
    /// Unix millis of the last dispatch attempt
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<JobError>,
    /// Earliest time a FailedRetryable job may be attempted again
    pub next_retry_at: Option<i64>,
    /// Fingerprint of the normalized payload
    pub content_hash: String,
    /// Ordered media blob ids
    pub media_refs: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Identifier assigned by the execution layer, set only once synced
    pub remote_id: Option<String>,
    pub synced_at: Option<i64>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bytes of payload counted against the storage quota.
    pub fn payload_size(&self) -> u64 {
        self.payload.to_string().len() as u64
    }
}

/// Media attached to a job at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMedia {
    /// Explicit MIME type; detected from the bytes when absent.
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

impl NewMedia {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            mime_type: None,
            data,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// MIME type given by the caller, sniffed from the content, or a generic fallback.
    pub fn resolved_mime_type(&self) -> String {
        self.mime_type
            .clone()
            .or_else(|| infer::get(&self.data).map(|kind| kind.mime_type().to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }
}

/// Everything needed to insert a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: Value,
    pub content_hash: String,
    pub media: Vec<NewMedia>,
}

impl NewJob {
    pub fn incoming_bytes(&self) -> u64 {
        self.payload.to_string().len() as u64
            + self.media.iter().map(|m| m.data.len() as u64).sum::<u64>()
    }
}

/// A binary attachment owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub id: String,
    pub job_id: String,
    pub position: u32,
    pub mime_type: String,
    pub size_bytes: u64,
    pub data: Vec<u8>,
    pub created_at: i64,
}

/// Partial update applied by `JobStore::update_job`.
///
/// The payload is not part of the patch: it is immutable once stored.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempt_count: Option<u32>,
    pub last_error: Option<Option<JobError>>,
    pub next_retry_at: Option<Option<i64>>,
}

/// Query used by `JobStore::get_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Empty means any status
    pub statuses: Vec<JobStatus>,
    pub kind: Option<JobKind>,
    pub content_hash: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    /// Oldest first when true, newest first otherwise
    pub oldest_first: bool,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            oldest_first: true,
            ..Default::default()
        }
    }

    pub fn with_statuses(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            oldest_first: true,
            ..Default::default()
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub synced: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
    /// failed_retryable + failed_terminal
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.synced + self.failed
    }
}

/// Bytes and row counts held by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub job_count: usize,
    pub media_count: usize,
    pub payload_bytes: u64,
    pub media_bytes: u64,
}

impl StorageUsage {
    pub fn total_bytes(&self) -> u64 {
        self.payload_bytes + self.media_bytes
    }
}

/// Storage held by jobs in one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUsage {
    pub status: JobStatus,
    pub job_count: usize,
    pub media_count: usize,
    pub payload_bytes: u64,
    pub media_bytes: u64,
}

/// A cleanup candidate with the bytes that deleting it would free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCandidate {
    pub job_id: String,
    pub status: JobStatus,
    pub media_refs: Vec<String>,
    pub bytes: u64,
    pub created_at: i64,
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
