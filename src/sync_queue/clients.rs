//! Interfaces to the collaborators outside the engine: the remote execution
//! layer, its read side, and the connectivity signal.

use super::models::{JobError, JobErrorType, JobKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Caller identity attached to every remote submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub identity: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rejected by remote: {0}")]
    Rejected(String),
}

impl ExecutionError {
    pub fn error_type(&self) -> JobErrorType {
        match self {
            ExecutionError::Validation(_) => JobErrorType::Validation,
            ExecutionError::Transport(_) => JobErrorType::Transport,
            ExecutionError::Timeout(_) => JobErrorType::Timeout,
            ExecutionError::Rejected(_) => JobErrorType::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_type().is_retryable()
    }

    pub fn to_job_error(&self) -> JobError {
        let message = match self {
            ExecutionError::Validation(m)
            | ExecutionError::Transport(m)
            | ExecutionError::Timeout(m)
            | ExecutionError::Rejected(m) => m.clone(),
        };
        JobError::new(self.error_type(), message)
    }
}

/// Remote execution layer. Submitting is opaque and may fail.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Execute one job remotely, returning the identifier assigned to it.
    async fn submit(
        &self,
        kind: &JobKind,
        payload: &Value,
        context: &ExecutionContext,
    ) -> Result<String, ExecutionError>;
}

/// A record confirmed by the remote execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub kind: JobKind,
    pub payload: Value,
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Unix millis
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteQuery {
    /// Only records created at or after this time (Unix millis)
    pub since: Option<i64>,
    pub content_hash: Option<String>,
    pub limit: Option<usize>,
}

/// Read side of the remote execution layer.
#[async_trait]
pub trait RemoteReader: Send + Sync {
    async fn fetch_confirmed(&self, query: &RemoteQuery) -> anyhow::Result<Vec<RemoteRecord>>;
}

/// Reader used when no remote read endpoint is configured.
pub struct NoRemoteReader;

#[async_trait]
impl RemoteReader for NoRemoteReader {
    async fn fetch_confirmed(&self, _query: &RemoteQuery) -> anyhow::Result<Vec<RemoteRecord>> {
        Ok(Vec::new())
    }
}

/// Online/offline signal. Observers are woken on every change.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Update the signal. Returns true if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
