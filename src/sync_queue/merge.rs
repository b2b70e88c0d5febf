//! Read-side merge of confirmed remote records and local jobs.
//!
//! A synced job already visible remotely (same remote id, or same kind and
//! content fingerprint confirmed after it) is shown once, as the remote
//! record. Jobs not yet confirmed are always listed. If the remote read
//! fails, the local records are returned and the failure is reported on the
//! view.

use super::clients::{RemoteQuery, RemoteReader, RemoteRecord};
use super::dedup::DeduplicationManager;
use super::event_bus::{EventBus, Subscription};
use super::job_store::JobStore;
use super::models::{Job, JobError, JobFilter, JobKind, JobStatus};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    /// Remote id for remote records, job id for local ones
    pub id: String,
    pub origin: RecordOrigin,
    pub kind: JobKind,
    pub payload: Value,
    pub created_at: i64,
    /// Local status; None for confirmed remote records
    pub status: Option<JobStatus>,
    pub content_hash: Option<String>,
    pub remote_id: Option<String>,
    /// Local job folded into this remote record, if any
    pub local_job_id: Option<String>,
    pub last_error: Option<JobError>,
}

impl MergedRecord {
    fn from_remote(record: RemoteRecord, content_hash: String) -> Self {
        Self {
            id: record.remote_id.clone(),
            origin: RecordOrigin::Remote,
            kind: record.kind,
            payload: record.payload,
            created_at: record.created_at,
            status: None,
            content_hash: Some(content_hash),
            remote_id: Some(record.remote_id),
            local_job_id: None,
            last_error: None,
        }
    }

    fn from_local(job: Job) -> Self {
        Self {
            id: job.id,
            origin: RecordOrigin::Local,
            kind: job.kind,
            payload: job.payload,
            created_at: job.created_at,
            status: Some(job.status),
            content_hash: Some(job.content_hash),
            remote_id: job.remote_id,
            local_job_id: None,
            last_error: job.last_error,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.origin == RecordOrigin::Remote
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedView {
    /// Newest first, ties by id ascending
    pub records: Vec<MergedRecord>,
    /// Set when the remote read failed and only local records are shown
    pub remote_error: Option<String>,
    pub remote_count: usize,
    pub local_count: usize,
}

impl MergedView {
    pub fn remote_failed(&self) -> bool {
        self.remote_error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Also show jobs that failed for good
    pub include_terminal_failures: bool,
    /// Only records created at or after this time (Unix millis)
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

pub struct MergeLayer {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteReader>,
    dedup: Arc<DeduplicationManager>,
}

impl MergeLayer {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteReader>,
        dedup: Arc<DeduplicationManager>,
    ) -> Self {
        Self {
            store,
            remote,
            dedup,
        }
    }

    /// Build the merged view. Only local store failures are errors.
    pub async fn merged_view(&self, options: &MergeOptions) -> Result<MergedView> {
        let mut statuses = vec![
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::FailedRetryable,
            JobStatus::Synced,
        ];
        if options.include_terminal_failures {
            statuses.push(JobStatus::FailedTerminal);
        }
        let local = self.store.get_jobs(&JobFilter {
            statuses,
            created_after: options.since,
            ..Default::default()
        })?;

        let query = RemoteQuery {
            since: options.since,
            content_hash: None,
            limit: options.limit,
        };
        let (remote, remote_error) = match self.remote.fetch_confirmed(&query).await {
            Ok(records) => (records, None),
            Err(e) => {
                warn!("Remote read failed, showing local records only: {:#}", e);
                (Vec::new(), Some(format!("{:#}", e)))
            }
        };

        let mut view = self.merge(remote, local);
        view.remote_error = remote_error;
        if let Some(limit) = options.limit {
            view.records.truncate(limit);
        }
        debug!(
            "Merged view: {} remote, {} local records",
            view.remote_count, view.local_count
        );
        Ok(view)
    }

    /// Merge already-fetched records.
    ///
    /// A local job is represented by a remote record when its `remote_id`
    /// matches. A synced job without such a match is folded by content hash
    /// into an unclaimed remote record of the same kind confirmed at or after
    /// the job was created. Jobs not yet confirmed are always listed.
    pub fn merge(&self, remote: Vec<RemoteRecord>, local: Vec<Job>) -> MergedView {
        let mut records: Vec<MergedRecord> = Vec::with_capacity(remote.len() + local.len());
        let mut by_remote_id: HashMap<String, usize> = HashMap::new();
        let mut by_hash: HashMap<String, Vec<usize>> = HashMap::new();

        for record in remote {
            if by_remote_id.contains_key(&record.remote_id) {
                continue;
            }
            let hash = record
                .content_hash
                .clone()
                .unwrap_or_else(|| self.dedup.generate_content_hash(&record.payload));
            let index = records.len();
            by_remote_id.insert(record.remote_id.clone(), index);
            by_hash.entry(hash.clone()).or_default().push(index);
            records.push(MergedRecord::from_remote(record, hash));
        }
        let remote_count = records.len();

        let mut seen_local: HashSet<String> = HashSet::new();
        for job in local {
            if !seen_local.insert(job.id.clone()) {
                continue;
            }
            let by_id = job
                .remote_id
                .as_ref()
                .and_then(|rid| by_remote_id.get(rid))
                .copied();
            let matched = by_id.or_else(|| {
                if job.status != JobStatus::Synced {
                    return None;
                }
                by_hash.get(&job.content_hash).and_then(|candidates| {
                    candidates.iter().copied().find(|&index| {
                        let record = &records[index];
                        record.local_job_id.is_none()
                            && record.kind == job.kind
                            && record.created_at >= job.created_at
                    })
                })
            });
            match matched {
                Some(index) => {
                    let remote = &mut records[index];
                    if remote.local_job_id.is_none() {
                        remote.local_job_id = Some(job.id);
                    }
                }
                None => records.push(MergedRecord::from_local(job)),
            }
        }
        let local_count = records.len() - remote_count;

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        MergedView {
            records,
            remote_error: None,
            remote_count,
            local_count,
        }
    }
}

/// Merged view recomputed lazily after any job event.
pub struct MergedViewCache {
    layer: Arc<MergeLayer>,
    options: MergeOptions,
    dirty: Arc<AtomicBool>,
    cached: tokio::sync::Mutex<Option<Arc<MergedView>>>,
    _subscription: Subscription,
}

impl MergedViewCache {
    pub fn new(layer: Arc<MergeLayer>, bus: &Arc<EventBus>, options: MergeOptions) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        let flag = dirty.clone();
        let subscription = bus.subscribe(move |_event| {
            flag.store(true, Ordering::SeqCst);
        });
        Self {
            layer,
            options,
            dirty,
            cached: tokio::sync::Mutex::new(None),
            _subscription: subscription,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Current view, recomputed if an event arrived since the last read.
    /// A view built without the remote side stays dirty.
    pub async fn get(&self) -> Result<Arc<MergedView>> {
        let mut cached = self.cached.lock().await;
        let was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        if !was_dirty {
            if let Some(view) = cached.as_ref() {
                return Ok(view.clone());
            }
        }

        let view = match self.layer.merged_view(&self.options).await {
            Ok(view) => Arc::new(view),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        if view.remote_failed() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        *cached = Some(view.clone());
        Ok(view)
    }
}
