//! Dispatches queued jobs to the execution client and records the outcome.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clients::{ExecutionClient, ExecutionContext, ExecutionError};
use super::event_bus::{EventBus, JobEvent};
use super::job_store::JobStore;
use super::models::{JobError, JobKind};
use super::retry_policy::RetryPolicy;
use crate::metrics;

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Synced { remote_id: String },
    Failed { error: JobError, terminal: bool },
    /// The job was not dispatched (gone, already claimed, or shutdown)
    Skipped,
}

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    client: Arc<dyn ExecutionClient>,
    retry_policy: Arc<RetryPolicy>,
    bus: Arc<EventBus>,
    context: RwLock<ExecutionContext>,
    request_timeout: Duration,
    /// Kinds that never share a chunk with another job of the same kind
    sequential_kinds: Vec<String>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn ExecutionClient>,
        retry_policy: Arc<RetryPolicy>,
        bus: Arc<EventBus>,
        request_timeout: Duration,
        sequential_kinds: Vec<String>,
    ) -> Self {
        Self {
            store,
            client,
            retry_policy,
            bus,
            context: RwLock::new(ExecutionContext::default()),
            request_timeout,
            sequential_kinds,
        }
    }

    /// Identity and session forwarded with every submission.
    pub fn set_context(&self, context: ExecutionContext) {
        *self.context.write().unwrap() = context;
    }

    pub fn context(&self) -> ExecutionContext {
        self.context.read().unwrap().clone()
    }

    fn is_sequential(&self, kind: &JobKind) -> bool {
        self.sequential_kinds.iter().any(|k| k == kind.as_str())
    }

    /// Claim and dispatch one job.
    ///
    /// Remote failures are recorded on the job and returned as
    /// `JobOutcome::Failed`; only store errors are returned as `Err`.
    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome> {
        if !self.store.claim_for_processing(job_id)? {
            debug!("Job {} is not pending, skipping", job_id);
            return Ok(JobOutcome::Skipped);
        }
        let Some(job) = self.store.get_job(job_id)? else {
            warn!("Job {} was deleted right after its claim, skipping", job_id);
            return Ok(JobOutcome::Skipped);
        };

        self.bus.publish(JobEvent::Processing {
            job_id: job.id.clone(),
            attempt: job.attempt_count,
        });
        debug!(
            "Dispatching job {} ({}), attempt {}",
            job.id, job.kind, job.attempt_count
        );

        let context = self.context();
        let result = match tokio::time::timeout(
            self.request_timeout,
            self.client.submit(&job.kind, &job.payload, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(format!(
                "No response after {}ms",
                self.request_timeout.as_millis()
            ))),
        };

        match result {
            Ok(remote_id) => {
                if let Err(e) = self.store.mark_synced(&job.id, &remote_id) {
                    return self.skip_if_deleted(&job.id, e);
                }
                self.retry_policy.record_success(&job.id);
                metrics::record_job_synced(job.kind.as_str());
                info!("Marked job {} as SYNCED (remote id {})", job.id, remote_id);
                self.bus.publish(JobEvent::Synced {
                    job_id: job.id.clone(),
                    remote_id: remote_id.clone(),
                });
                Ok(JobOutcome::Synced { remote_id })
            }
            Err(e) => {
                let error = e.to_job_error();
                let retry = self.retry_policy.should_retry(&job, &error);
                let next_retry_at = retry.then(|| self.retry_policy.next_retry_at(job.attempt_count));

                if let Err(e) = self
                    .store
                    .mark_failed(&job.id, &error, !retry, next_retry_at)
                {
                    return self.skip_if_deleted(&job.id, e);
                }
                self.retry_policy.record_attempt(&job.id, &error);
                metrics::record_job_failed(error.error_type.as_str(), !retry);

                if retry {
                    warn!(
                        "Job {} failed (attempt {}/{}): {}, will retry",
                        job.id, job.attempt_count, self.retry_policy.max_attempts, error
                    );
                } else {
                    warn!(
                        "Job {} failed permanently after {} attempts: {}",
                        job.id, job.attempt_count, error
                    );
                }

                self.bus.publish(JobEvent::Failed {
                    job_id: job.id.clone(),
                    error: error.clone(),
                    terminal: !retry,
                    next_retry_at,
                });
                Ok(JobOutcome::Failed {
                    error,
                    terminal: !retry,
                })
            }
        }
    }

    /// A job deleted while its submission was in flight has no row left to
    /// record the result on. That is reported as `Skipped`; any other store
    /// error is returned.
    fn skip_if_deleted(&self, job_id: &str, error: anyhow::Error) -> Result<JobOutcome> {
        if self.store.get_job(job_id)?.is_none() {
            warn!("Job {} was deleted while processing, dropping its result", job_id);
            return Ok(JobOutcome::Skipped);
        }
        Err(error)
    }

    /// Split jobs, given in creation order, into chunks dispatched one after
    /// the other. A chunk holds at most `batch_size` jobs and never two jobs
    /// of the same sequential kind.
    pub fn plan_chunks(&self, jobs: &[(String, JobKind)], batch_size: usize) -> Vec<Vec<String>> {
        let batch_size = batch_size.max(1);
        let mut chunks: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_kinds: Vec<&JobKind> = Vec::new();

        for (id, kind) in jobs {
            let conflict = self.is_sequential(kind) && current_kinds.contains(&kind);
            if current.len() >= batch_size || conflict {
                chunks.push(std::mem::take(&mut current));
                current_kinds.clear();
            }
            current.push(id.clone());
            current_kinds.push(kind);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Dispatch several jobs with bounded concurrency.
    ///
    /// Jobs run in chunks (see `plan_chunks`); a chunk starts only after the
    /// previous one finished. Once `shutdown` is cancelled, remaining jobs
    /// are reported as skipped. A store error stops the batch after the
    /// current chunk.
    pub async fn process_batch(
        &self,
        job_ids: &[String],
        batch_size: usize,
        shutdown: &CancellationToken,
    ) -> Result<Vec<(String, JobOutcome)>> {
        let mut outcomes = Vec::with_capacity(job_ids.len());
        let mut planned = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            match self.store.get_job(id)? {
                Some(job) => planned.push((job.id, job.kind)),
                None => outcomes.push((id.clone(), JobOutcome::Skipped)),
            }
        }

        let mut chunks = self.plan_chunks(&planned, batch_size).into_iter();
        while let Some(chunk) = chunks.next() {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, not starting remaining jobs");
                outcomes.extend(chunk.into_iter().map(|id| (id, JobOutcome::Skipped)));
                for rest in chunks.by_ref() {
                    outcomes.extend(rest.into_iter().map(|id| (id, JobOutcome::Skipped)));
                }
                break;
            }

            let results = join_all(chunk.iter().map(|id| self.process_job(id))).await;
            let mut store_error = None;
            for (id, result) in chunk.into_iter().zip(results) {
                match result {
                    Ok(outcome) => outcomes.push((id, outcome)),
                    Err(e) => {
                        store_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = store_error {
                return Err(e);
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::sync_queue::job_store::SqliteJobStore;
    use crate::sync_queue::models::{JobErrorType, JobStatus, NewJob};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Client returning scripted results, then succeeding.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, ExecutionError>>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<(String, ExecutionContext)>>,
    }

    #[async_trait]
    impl ExecutionClient for ScriptedClient {
        async fn submit(
            &self,
            kind: &JobKind,
            _payload: &Value,
            context: &ExecutionContext,
        ) -> Result<String, ExecutionError> {
            self.calls
                .lock()
                .unwrap()
                .push((kind.as_str().to_string(), context.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("0xremote".to_string()))
        }
    }

    fn setup(
        client: ScriptedClient,
        max_attempts: u32,
    ) -> (Arc<SqliteJobStore>, Arc<ScriptedClient>, Arc<EventBus>, JobProcessor) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let client = Arc::new(client);
        let bus = EventBus::new();
        let policy = Arc::new(RetryPolicy::new(&RetrySettings {
            max_attempts,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.0,
        }));
        let processor = JobProcessor::new(
            store.clone(),
            client.clone(),
            policy,
            bus.clone(),
            Duration::from_millis(200),
            vec!["submit-approval".to_string()],
        );
        (store, client, bus, processor)
    }

    fn add(store: &SqliteJobStore, kind: JobKind, n: u32) -> String {
        store
            .add_job(NewJob {
                kind,
                payload: serde_json::json!({ "n": n }),
                content_hash: format!("h{}", n),
                media: vec![],
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_success_marks_synced_and_publishes() {
        let (store, client, bus, processor) = setup(ScriptedClient::default(), 3);
        processor.set_context(ExecutionContext {
            identity: Some("did:field:alice".to_string()),
            session: Some("s1".to_string()),
        });
        let mut rx = bus.subscribe_channel();
        let id = add(&store, JobKind::SubmitWork, 1);

        let outcome = processor.process_job(&id).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Synced {
                remote_id: "0xremote".to_string()
            }
        );

        let job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Synced);
        assert_eq!(job.remote_id.as_deref(), Some("0xremote"));
        assert_eq!(job.attempt_count, 1);

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Processing { attempt: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Synced { .. }));

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].0, "submit-work");
        assert_eq!(calls[0].1.identity.as_deref(), Some("did:field:alice"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal() {
        let client = ScriptedClient::default();
        client
            .script
            .lock()
            .unwrap()
            .push_back(Err(ExecutionError::Validation("missing site".into())));
        let (store, _client, _bus, processor) = setup(client, 3);
        let id = add(&store, JobKind::SubmitWork, 1);

        let outcome = processor.process_job(&id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { terminal: true, .. }));

        let job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::FailedTerminal);
        assert_eq!(
            job.last_error.unwrap().error_type,
            JobErrorType::Validation
        );
        assert!(job.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let client = ScriptedClient::default();
        client
            .script
            .lock()
            .unwrap()
            .push_back(Err(ExecutionError::Transport("connection reset".into())));
        let (store, _client, _bus, processor) = setup(client, 3);
        let id = add(&store, JobKind::SubmitWork, 1);

        let outcome = processor.process_job(&id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { terminal: false, .. }));

        let job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::FailedRetryable);
        assert!(job.next_retry_at.unwrap() > job.last_attempt_at.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let client = ScriptedClient {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (store, _client, _bus, processor) = setup(client, 3);
        let id = add(&store, JobKind::SubmitWork, 1);

        let outcome = processor.process_job(&id).await.unwrap();
        match outcome {
            JobOutcome::Failed { error, terminal } => {
                assert_eq!(error.error_type, JobErrorType::Timeout);
                assert!(!terminal);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_ceiling_turns_terminal() {
        let client = ScriptedClient::default();
        client
            .script
            .lock()
            .unwrap()
            .push_back(Err(ExecutionError::Transport("down".into())));
        let (store, _client, _bus, processor) = setup(client, 1);
        let id = add(&store, JobKind::SubmitWork, 1);

        let outcome = processor.process_job(&id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { terminal: true, .. }));
        assert_eq!(
            store.get_job(&id).unwrap().unwrap().status,
            JobStatus::FailedTerminal
        );
    }

    #[tokio::test]
    async fn test_non_pending_job_is_skipped() {
        let (store, client, _bus, processor) = setup(ScriptedClient::default(), 3);
        let id = add(&store, JobKind::SubmitWork, 1);
        store.claim_for_processing(&id).unwrap();

        assert_eq!(processor.process_job(&id).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(
            processor.process_job("missing").await.unwrap(),
            JobOutcome::Skipped
        );
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_plan_chunks_respects_batch_size_and_sequential_kinds() {
        let (_store, _client, _bus, processor) = setup(ScriptedClient::default(), 3);
        let jobs = vec![
            ("w1".to_string(), JobKind::SubmitWork),
            ("a1".to_string(), JobKind::SubmitApproval),
            ("w2".to_string(), JobKind::SubmitWork),
            ("a2".to_string(), JobKind::SubmitApproval),
            ("w3".to_string(), JobKind::SubmitWork),
            ("w4".to_string(), JobKind::SubmitWork),
        ];

        let chunks = processor.plan_chunks(&jobs, 3);
        assert_eq!(
            chunks,
            vec![
                vec!["w1".to_string(), "a1".to_string(), "w2".to_string()],
                vec!["a2".to_string(), "w3".to_string(), "w4".to_string()],
            ]
        );

        let chunks = processor.plan_chunks(&jobs, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], vec!["w1", "a1", "w2"]);
        assert_eq!(chunks[1], vec!["a2", "w3", "w4"]);

        // Zero is treated as one
        assert_eq!(processor.plan_chunks(&jobs, 0).len(), 6);
    }

    #[tokio::test]
    async fn test_process_batch_runs_in_creation_order() {
        let (store, client, _bus, processor) = setup(ScriptedClient::default(), 3);
        let ids = vec![
            add(&store, JobKind::SubmitApproval, 1),
            add(&store, JobKind::SubmitApproval, 2),
            add(&store, JobKind::SubmitApproval, 3),
        ];

        let outcomes = processor
            .process_batch(&ids, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, JobOutcome::Synced { .. })));
        let order: Vec<String> = outcomes.into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, ids);
        assert_eq!(client.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_process_batch_after_shutdown_skips_everything() {
        let (store, client, _bus, processor) = setup(ScriptedClient::default(), 3);
        let ids = vec![
            add(&store, JobKind::SubmitWork, 1),
            add(&store, JobKind::SubmitWork, 2),
        ];
        let token = CancellationToken::new();
        token.cancel();

        let outcomes = processor.process_batch(&ids, 1, &token).await.unwrap();
        assert!(outcomes.iter().all(|(_, o)| *o == JobOutcome::Skipped));
        assert!(client.calls.lock().unwrap().is_empty());
        assert_eq!(
            store.get_job(&ids[0]).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    /// Deletes every processing job during its first submission.
    struct DeletingClient {
        store: Arc<SqliteJobStore>,
        deleted: Mutex<bool>,
    }

    #[async_trait]
    impl ExecutionClient for DeletingClient {
        async fn submit(
            &self,
            _kind: &JobKind,
            _payload: &Value,
            _context: &ExecutionContext,
        ) -> Result<String, ExecutionError> {
            let mut deleted = self.deleted.lock().unwrap();
            if !*deleted {
                *deleted = true;
                for job in self
                    .store
                    .get_jobs(&crate::sync_queue::models::JobFilter::with_status(
                        JobStatus::Processing,
                    ))
                    .unwrap()
                {
                    self.store.delete_job(&job.id).unwrap();
                }
            }
            Ok("0xremote".to_string())
        }
    }

    #[tokio::test]
    async fn test_job_deleted_mid_dispatch_does_not_stop_batch() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let processor = JobProcessor::new(
            store.clone(),
            Arc::new(DeletingClient {
                store: store.clone(),
                deleted: Mutex::new(false),
            }),
            Arc::new(RetryPolicy::new(&RetrySettings::default())),
            EventBus::new(),
            Duration::from_millis(200),
            vec![],
        );
        let ids = vec![
            add(&store, JobKind::SubmitWork, 1),
            add(&store, JobKind::SubmitWork, 2),
        ];

        let outcomes = processor
            .process_batch(&ids, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcomes[0], (ids[0].clone(), JobOutcome::Skipped));
        assert!(matches!(outcomes[1].1, JobOutcome::Synced { .. }));
        assert!(store.get_job(&ids[0]).unwrap().is_none());
        assert_eq!(
            store.get_job(&ids[1]).unwrap().unwrap().status,
            JobStatus::Synced
        );
    }
}
