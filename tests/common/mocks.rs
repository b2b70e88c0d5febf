//! Scripted stand-ins for the remote execution layer.

use async_trait::async_trait;
use offline_sync_engine::sync_queue::{
    ExecutionClient, ExecutionContext, ExecutionError, JobKind, RemoteQuery, RemoteReader,
    RemoteRecord,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the mock client does for one submission.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum MockResponse {
    Ok(String),
    Err(ExecutionError),
    /// Never answer; the engine's request timeout fires
    Hang,
}

/// Execution client answering from a script, then succeeding.
#[derive(Default)]
pub struct MockExecutionClient {
    script: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<(JobKind, Value, ExecutionContext)>>,
    counter: AtomicUsize,
    delay: Mutex<Duration>,
}

#[allow(dead_code)]
impl MockExecutionClient {
    pub fn push(&self, response: MockResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_many(&self, response: MockResponse, times: usize) {
        for _ in 0..times {
            self.push(response.clone());
        }
    }

    /// Delay applied to every answer.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn submitted_payloads(&self) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }

    pub fn submitted_contexts(&self) -> Vec<ExecutionContext> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, context)| context.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutionClient for MockExecutionClient {
    async fn submit(
        &self,
        kind: &JobKind,
        payload: &Value,
        context: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        self.calls
            .lock()
            .unwrap()
            .push((kind.clone(), payload.clone(), context.clone()));
        let response = self.script.lock().unwrap().pop_front();
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match response {
            Some(MockResponse::Ok(remote_id)) => Ok(remote_id),
            Some(MockResponse::Err(e)) => Err(e),
            Some(MockResponse::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ExecutionError::Transport("unreachable".to_string()))
            }
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("0xremote{:04}", n))
            }
        }
    }
}

/// Remote read side holding a fixed record set.
#[derive(Default)]
pub struct MockRemoteReader {
    records: Mutex<Vec<RemoteRecord>>,
    fail: AtomicBool,
}

#[allow(dead_code)]
impl MockRemoteReader {
    pub fn confirm(&self, record: RemoteRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteReader for MockRemoteReader {
    async fn fetch_confirmed(&self, query: &RemoteQuery) -> anyhow::Result<Vec<RemoteRecord>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("remote index unavailable");
        }
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| query.since.map_or(true, |since| r.created_at >= since))
            .filter(|r| match (&query.content_hash, &r.content_hash) {
                (Some(wanted), Some(hash)) => wanted == hash,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
