//! Flush orchestration.
//!
//! A flush promotes due retries, then hands every pending job, oldest first,
//! to the job processor. Flushes are single-flight: callers arriving while a
//! flush runs share its result instead of starting another one. Flushes are
//! triggered explicitly, when connectivity comes back, or by a periodic timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clients::ConnectivityMonitor;
use super::job_processor::{JobOutcome, JobProcessor};
use super::job_store::JobStore;
use super::models::{now_millis, JobFilter, JobStatus};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Flushing,
}

/// Summary of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Jobs confirmed by the remote
    pub processed: usize,
    /// Jobs whose attempt failed, retryable or not
    pub failed: usize,
    /// Failed jobs that will not be retried
    pub terminal: usize,
    /// Pending jobs not dispatched: offline, claimed elsewhere, or shutdown
    pub skipped: usize,
    /// Retryable jobs moved back to pending at the start of the flush
    pub promoted: usize,
    /// The flush found the connectivity signal offline
    pub offline: bool,
    pub synced_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    pub started_at: i64,
    pub duration_ms: u64,
}

/// Error that prevented a flush from completing. Shared by every caller
/// waiting on the same flush.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError {
    #[error("Store error during flush: {0}")]
    Store(String),

    #[error("Flush task aborted: {0}")]
    Aborted(String),
}

type SharedFlush = Shared<BoxFuture<'static, Result<Arc<FlushReport>, FlushError>>>;

struct SyncInner {
    store: Arc<dyn JobStore>,
    processor: Arc<JobProcessor>,
    connectivity: Arc<ConnectivityMonitor>,
    batch_size: usize,
    in_flight: Mutex<Option<SharedFlush>>,
    shutdown: CancellationToken,
}

impl SyncInner {
    fn flush(self: &Arc<Self>) -> SharedFlush {
        let mut slot = self.in_flight.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            debug!("Flush already in flight, joining it");
            return existing.clone();
        }

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let result = inner.run_flush().await.map(Arc::new);
            *inner.in_flight.lock().unwrap() = None;
            result
        });
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FlushError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();
        *slot = Some(shared.clone());
        shared
    }

    async fn run_flush(&self) -> Result<FlushReport, FlushError> {
        let started = Instant::now();
        let mut report = FlushReport {
            started_at: now_millis(),
            ..Default::default()
        };
        let store_err = |e: anyhow::Error| FlushError::Store(format!("{:#}", e));

        report.promoted = self
            .store
            .promote_retry_ready(report.started_at)
            .map_err(store_err)?
            .len();
        if report.promoted > 0 {
            info!("Promoted {} jobs ready for retry", report.promoted);
        }

        let pending = self
            .store
            .get_jobs(&JobFilter::with_status(JobStatus::Pending))
            .map_err(store_err)?;

        if !self.connectivity.is_online() {
            report.offline = true;
            report.skipped = pending.len();
            debug!("Offline, leaving {} jobs pending", pending.len());
        } else if !pending.is_empty() {
            info!("Flushing {} pending jobs", pending.len());
            let ids: Vec<String> = pending.into_iter().map(|job| job.id).collect();
            let outcomes = self
                .processor
                .process_batch(&ids, self.batch_size, &self.shutdown)
                .await
                .map_err(store_err)?;

            for (id, outcome) in outcomes {
                match outcome {
                    JobOutcome::Synced { .. } => {
                        report.processed += 1;
                        report.synced_ids.push(id);
                    }
                    JobOutcome::Failed { terminal, .. } => {
                        report.failed += 1;
                        if terminal {
                            report.terminal += 1;
                        }
                        report.failed_ids.push(id);
                    }
                    JobOutcome::Skipped => report.skipped += 1,
                }
            }
        }

        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        metrics::record_flush(elapsed);
        if let Ok(stats) = self.store.stats() {
            metrics::update_queue_stats(&stats);
        }

        if report.processed + report.failed > 0 {
            info!(
                "Flush complete in {}ms: {} synced, {} failed ({} terminal), {} skipped",
                report.duration_ms, report.processed, report.failed, report.terminal, report.skipped
            );
        }
        Ok(report)
    }
}

pub struct SyncManager {
    inner: Arc<SyncInner>,
    periodic: Mutex<Option<CancellationToken>>,
    watcher_started: AtomicBool,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<JobProcessor>,
        connectivity: Arc<ConnectivityMonitor>,
        batch_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                processor,
                connectivity,
                batch_size: batch_size.max(1),
                in_flight: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            periodic: Mutex::new(None),
            watcher_started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.inner.in_flight.lock().unwrap().is_some() {
            SyncState::Flushing
        } else {
            SyncState::Idle
        }
    }

    /// Run a flush, or join the one already running.
    ///
    /// Per-job failures are recorded on the jobs and counted in the report;
    /// only store failures are returned as errors.
    pub async fn flush(&self) -> Result<Arc<FlushReport>, FlushError> {
        self.inner.flush().await
    }

    /// Flush whenever the connectivity signal goes from offline to online.
    /// Must be called from within a tokio runtime; later calls are no-ops.
    pub fn start_connectivity_watcher(&self) {
        if self.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = self.inner.clone();
        let mut rx = inner.connectivity.subscribe();
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *rx.borrow_and_update();
                        if online && !was_online {
                            info!("Connectivity restored, starting flush");
                            let flush = inner.flush();
                            tokio::spawn(async move {
                                if let Err(e) = flush.await {
                                    error!("Reconnect flush failed: {}", e);
                                }
                            });
                        }
                        was_online = online;
                    }
                    _ = inner.shutdown.cancelled() => break,
                }
            }
            debug!("Connectivity watcher stopped");
        });
    }

    /// Flush every `interval`, replacing any previous timer.
    pub fn start_periodic(&self, interval: Duration) {
        let token = self.inner.shutdown.child_token();
        if let Some(previous) = self.periodic.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let inner = self.inner.clone();
        info!("Periodic sync every {}s", interval.as_secs_f64());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = inner.flush().await {
                            warn!("Periodic flush failed: {}", e);
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("Periodic sync stopped");
        });
    }

    pub fn stop_periodic(&self) {
        if let Some(token) = self.periodic.lock().unwrap().take() {
            token.cancel();
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Stop the timer and the watcher. A running flush finishes the jobs
    /// already dispatched and starts no new ones.
    pub fn shutdown(&self) {
        info!("Sync manager shutting down");
        self.inner.shutdown.cancel();
        self.stop_periodic();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::sync_queue::clients::{ExecutionClient, ExecutionContext, ExecutionError};
    use crate::sync_queue::event_bus::EventBus;
    use crate::sync_queue::job_store::SqliteJobStore;
    use crate::sync_queue::models::{JobKind, NewJob};
    use crate::sync_queue::retry_policy::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct SlowClient {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionClient for SlowClient {
        async fn submit(
            &self,
            _kind: &JobKind,
            payload: &Value,
            _context: &ExecutionContext,
        ) -> Result<String, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("0x{}", payload["n"]))
        }
    }

    struct Fixture {
        store: Arc<SqliteJobStore>,
        client: Arc<SlowClient>,
        connectivity: Arc<ConnectivityMonitor>,
        manager: SyncManager,
    }

    fn fixture(delay_ms: u64, online: bool) -> Fixture {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
        });
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            client.clone(),
            Arc::new(RetryPolicy::new(&RetrySettings::default())),
            EventBus::new(),
            Duration::from_secs(5),
            vec![],
        ));
        let manager = SyncManager::new(store.clone(), processor, connectivity.clone(), 4);
        Fixture {
            store,
            client,
            connectivity,
            manager,
        }
    }

    fn add(store: &SqliteJobStore, n: u32) -> String {
        store
            .add_job(NewJob {
                kind: JobKind::SubmitWork,
                payload: serde_json::json!({ "n": n }),
                content_hash: format!("h{}", n),
                media: vec![],
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_flush_syncs_pending_jobs() {
        let f = fixture(0, true);
        let a = add(&f.store, 1);
        let b = add(&f.store, 2);

        let report = f.manager.flush().await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.synced_ids, vec![a.clone(), b]);
        assert_eq!(
            f.store.get_job(&a).unwrap().unwrap().status,
            JobStatus::Synced
        );
        assert_eq!(f.manager.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_share_result() {
        let f = fixture(100, true);
        for n in 0..3 {
            add(&f.store, n);
        }

        let (first, second) = tokio::join!(f.manager.flush(), f.manager.flush());
        let first = first.unwrap();
        let second = second.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.processed, 3);
        // Each job dispatched exactly once
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_state_while_flushing() {
        let f = fixture(100, true);
        add(&f.store, 1);

        let flush = f.manager.flush();
        tokio::pin!(flush);
        // Poll once so the flush starts
        assert!(futures::poll!(&mut flush).is_pending());
        assert_eq!(f.manager.state(), SyncState::Flushing);

        flush.await.unwrap();
        assert_eq!(f.manager.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_offline_flush_skips_everything() {
        let f = fixture(0, false);
        let id = add(&f.store, 1);

        let report = f.manager.flush().await.unwrap();
        assert!(report.offline);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(f.client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.store.get_job(&id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_reconnect_triggers_flush() {
        let f = fixture(0, false);
        let id = add(&f.store, 1);
        f.manager.start_connectivity_watcher();
        tokio::task::yield_now().await;

        f.connectivity.set_online(true);

        let mut synced = false;
        for _ in 0..100 {
            if f.store.get_job(&id).unwrap().unwrap().status == JobStatus::Synced {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced, "job should sync after reconnect");
        f.manager.shutdown();
    }

    #[tokio::test]
    async fn test_periodic_flush_and_stop() {
        let f = fixture(0, true);
        let id = add(&f.store, 1);

        f.manager.start_periodic(Duration::from_millis(20));
        assert!(f.manager.is_periodic_running());

        let mut synced = false;
        for _ in 0..100 {
            if f.store.get_job(&id).unwrap().unwrap().status == JobStatus::Synced {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced);

        f.manager.stop_periodic();
        assert!(!f.manager.is_periodic_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_new_dispatches() {
        let f = fixture(0, true);
        let id = add(&f.store, 1);
        f.manager.start_periodic(Duration::from_secs(60));

        f.manager.shutdown();
        assert!(f.manager.is_shut_down());
        assert!(!f.manager.is_periodic_running());

        let report = f.manager.flush().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            f.store.get_job(&id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }
}
