//! Composition root of the sync engine.
//!
//! `SyncEngine` is built from an injected store, execution client, remote
//! reader and connectivity signal. It owns the admission gate for new jobs
//! (duplicate check, then quota check) and exposes the public API.

use super::clients::{ConnectivityMonitor, ExecutionClient, ExecutionContext, RemoteReader};
use super::dedup::{DeduplicationManager, DuplicateMatch, DuplicateVerdict, MatchReason};
use super::event_bus::{EventBus, JobEvent, JobEventKind, Subscription};
use super::job_processor::JobProcessor;
use super::job_store::JobStore;
use super::media::MediaManager;
use super::merge::{MergeLayer, MergeOptions, MergedView, MergedViewCache};
use super::models::{Job, JobFilter, JobKind, NewJob, NewMedia, QueueStats};
use super::retry_policy::{RetryPolicy, RetryStats};
use super::storage_manager::{CleanupPolicy, StorageManager};
use super::sync_manager::{FlushError, FlushReport, SyncManager, SyncState};
use crate::config::{
    AppConfig, DedupSettings, RetrySettings, SimilarityMode, StorageSettings, SyncSettings,
};
use crate::metrics;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub media_dir: PathBuf,
    pub sync: SyncSettings,
    pub retry: RetrySettings,
    pub dedup: DedupSettings,
    pub storage: StorageSettings,
}

impl EngineSettings {
    /// Default settings with media materialized under `media_dir`.
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
            sync: SyncSettings::default(),
            retry: RetrySettings::default(),
            dedup: DedupSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            media_dir: config.media_dir.clone(),
            sync: config.sync.clone(),
            retry: config.retry.clone(),
            dedup: config.dedup.clone(),
            storage: config.storage.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddJobOptions {
    /// Run storage cleanup and check again when the quota is exceeded
    pub force_cleanup: bool,
}

/// A job accepted into the queue.
#[derive(Debug, Clone, Serialize)]
pub struct AddJobOutcome {
    pub job: Job,
    /// Similar existing jobs reported without blocking
    pub similar: Vec<DuplicateMatch>,
}

#[derive(Debug, Error)]
pub enum AddJobError {
    #[error("Duplicate of existing job {}", .existing.id)]
    DuplicateDetected { existing: DuplicateMatch },

    #[error("Blocked by {} similar jobs", .similar.len())]
    SimilarBlocked { similar: Vec<DuplicateMatch> },

    #[error(
        "Storage quota exceeded: {used_bytes} bytes used, {incoming_bytes} incoming, quota {quota_bytes}"
    )]
    QuotaExceeded {
        used_bytes: u64,
        quota_bytes: u64,
        incoming_bytes: u64,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct SyncEngine {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    connectivity: Arc<ConnectivityMonitor>,
    dedup: Arc<DeduplicationManager>,
    retry_policy: Arc<RetryPolicy>,
    media: Arc<MediaManager>,
    processor: Arc<JobProcessor>,
    sync: SyncManager,
    merge: Arc<MergeLayer>,
    storage: Arc<StorageManager>,
    settings: EngineSettings,
    /// Held from the duplicate check until the job is stored
    admission: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Wire the engine. Jobs left processing by a previous run are
    /// returned to pending. Background tasks start with `start`.
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn ExecutionClient>,
        remote: Arc<dyn RemoteReader>,
        connectivity: Arc<ConnectivityMonitor>,
        settings: EngineSettings,
    ) -> Result<Self> {
        let interrupted = store.reset_interrupted()?;
        if interrupted > 0 {
            info!("Reset {} interrupted jobs to pending", interrupted);
        }

        let bus = EventBus::new();
        let retry_policy = Arc::new(RetryPolicy::new(&settings.retry));
        let dedup = Arc::new(DeduplicationManager::new(
            store.clone(),
            remote.clone(),
            settings.dedup.clone(),
        ));
        let media = Arc::new(MediaManager::new(store.clone(), &settings.media_dir)?);
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            client,
            retry_policy.clone(),
            bus.clone(),
            settings.sync.request_timeout(),
            settings.sync.sequential_kinds.clone(),
        ));
        let sync = SyncManager::new(
            store.clone(),
            processor.clone(),
            connectivity.clone(),
            settings.sync.batch_size,
        );
        let merge = Arc::new(MergeLayer::new(store.clone(), remote, dedup.clone()));
        let storage = Arc::new(StorageManager::new(
            store.clone(),
            media.clone(),
            retry_policy.clone(),
            bus.clone(),
            CleanupPolicy::from(&settings.storage),
        ));

        if let Ok(stats) = store.stats() {
            metrics::update_queue_stats(&stats);
        }

        Ok(Self {
            store,
            bus,
            connectivity,
            dedup,
            retry_policy,
            media,
            processor,
            sync,
            merge,
            storage,
            settings,
            admission: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the connectivity watcher, the periodic sync timer and the
    /// cleanup task. Intervals of zero disable the matching task.
    pub fn start(&self) {
        self.sync.start_connectivity_watcher();
        if self.settings.sync.periodic_interval_secs > 0 {
            self.sync
                .start_periodic(Duration::from_secs(self.settings.sync.periodic_interval_secs));
        }
        if self.settings.storage.cleanup_interval_secs > 0 {
            self.storage.spawn_cleanup_task(
                Duration::from_secs(self.settings.storage.cleanup_interval_secs),
                self.shutdown.child_token(),
            );
        }
    }

    /// Queue a job after the duplicate and quota checks.
    pub async fn add_job(
        &self,
        kind: JobKind,
        payload: Value,
        media: Vec<NewMedia>,
        options: AddJobOptions,
    ) -> Result<AddJobOutcome, AddJobError> {
        let _admission = self.admission.lock().await;
        let check = self.dedup.perform_comprehensive_check(&kind, &payload).await?;

        let similar = match check.verdict {
            DuplicateVerdict::Unique => Vec::new(),
            DuplicateVerdict::ExactDuplicate(existing) => {
                info!(
                    "Rejected {} job: duplicate of {:?} {}",
                    kind, existing.source, existing.id
                );
                metrics::record_job_rejected("duplicate");
                return Err(AddJobError::DuplicateDetected { existing });
            }
            DuplicateVerdict::Similar(matches) => {
                if self.settings.dedup.similarity_mode == SimilarityMode::Block {
                    let blocking: Vec<DuplicateMatch> = matches
                        .iter()
                        .filter(|m| m.reason == MatchReason::SimilarFields)
                        .cloned()
                        .collect();
                    if !blocking.is_empty() {
                        info!("Rejected {} job: {} similar jobs", kind, blocking.len());
                        metrics::record_job_rejected("similar");
                        return Err(AddJobError::SimilarBlocked { similar: blocking });
                    }
                }
                warn!("New {} job resembles {} existing jobs", kind, matches.len());
                matches
            }
        };

        let new_job = NewJob {
            kind,
            payload,
            content_hash: check.content_hash,
            media,
        };
        let incoming_bytes = new_job.incoming_bytes();
        let mut capacity = self.storage.check_capacity(incoming_bytes)?;
        if !capacity.fits && options.force_cleanup {
            info!("Quota exceeded, running cleanup before queueing");
            self.storage.perform_cleanup()?;
            capacity = self.storage.check_capacity(incoming_bytes)?;
        }
        if !capacity.fits {
            metrics::record_job_rejected("quota");
            return Err(AddJobError::QuotaExceeded {
                used_bytes: capacity.used_bytes,
                quota_bytes: capacity.quota_bytes,
                incoming_bytes,
            });
        }

        let job = self.store.add_job(new_job)?;
        info!(
            "Queued {} job {} with {} media",
            job.kind,
            job.id,
            job.media_refs.len()
        );
        metrics::record_job_added(job.kind.as_str());
        if let Ok(stats) = self.store.stats() {
            metrics::update_queue_stats(&stats);
        }
        self.bus.publish(JobEvent::Added { job: job.clone() });

        Ok(AddJobOutcome { job, similar })
    }

    /// Delete a job in any status, with its media.
    pub fn delete_job(&self, job_id: &str) -> Result<bool> {
        if !self.store.delete_job(job_id)? {
            return Ok(false);
        }
        self.media.cleanup_job(job_id)?;
        self.retry_policy.forget(job_id);
        self.bus.publish(JobEvent::Removed {
            job_id: job_id.to_string(),
        });
        info!("Deleted job {}", job_id);
        Ok(true)
    }

    /// Delete synced jobs, optionally only those confirmed before `older_than`.
    pub fn clear_synced(&self, older_than: Option<i64>) -> Result<Vec<String>> {
        let removed = self.store.clear_synced(older_than)?;
        for job_id in &removed {
            if let Err(e) = self.media.cleanup_job(job_id) {
                warn!("Failed to release media handles of job {}: {:#}", job_id, e);
            }
            self.retry_policy.forget(job_id);
            self.bus.publish(JobEvent::Removed {
                job_id: job_id.clone(),
            });
        }
        debug!("Cleared {} synced jobs", removed.len());
        Ok(removed)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id)
    }

    pub fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.get_jobs(filter)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry_policy.get_stats()
    }

    pub fn set_context(&self, context: ExecutionContext) {
        self.processor.set_context(context);
    }

    pub async fn flush(&self) -> Result<Arc<FlushReport>, FlushError> {
        self.sync.flush().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn start_periodic(&self, interval: Duration) {
        self.sync.start_periodic(interval);
    }

    pub fn stop_periodic(&self) {
        self.sync.stop_periodic();
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    pub fn subscribe_kind<F>(&self, kind: JobEventKind, callback: F) -> Subscription
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe_kind(kind, callback)
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe_channel()
    }

    pub async fn merged_view(&self, options: &MergeOptions) -> Result<MergedView> {
        self.merge.merged_view(options).await
    }

    /// A merged view that refreshes itself after job events.
    pub fn merged_view_cache(&self, options: MergeOptions) -> MergedViewCache {
        MergedViewCache::new(self.merge.clone(), &self.bus, options)
    }

    pub fn dedup(&self) -> &DeduplicationManager {
        &self.dedup
    }

    pub fn media(&self) -> &Arc<MediaManager> {
        &self.media
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Stop background tasks and release every media handle. A running
    /// flush finishes the jobs already dispatched.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sync.shutdown();
        match self.media.cleanup_all() {
            Ok(released) if released > 0 => debug!("Released {} media handles", released),
            Ok(_) => {}
            Err(e) => warn!("Failed to release media handles: {:#}", e),
        }
        info!("Sync engine stopped");
    }
}
