//! Local storage quota and cleanup.
//!
//! Only terminal jobs (synced or failed for good) are ever removed: first
//! those older than the policy's age limit, then, while usage is above the
//! pressure threshold, the oldest remaining ones.

use super::event_bus::{EventBus, JobEvent};
use super::job_store::JobStore;
use super::media::MediaManager;
use super::models::{now_millis, CleanupCandidate, QueueStats, StatusUsage, StorageUsage};
use super::retry_policy::{RetryPolicy, RetryStats};
use crate::config::StorageSettings;
use crate::metrics;
use anyhow::Result;
use byte_unit::Byte;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupPolicy {
    /// Terminal jobs last updated longer ago than this are removed
    pub max_age_secs: u64,
    pub quota_bytes: u64,
    /// Fraction of the quota above which cleanup ignores age
    pub pressure_threshold: f64,
}

impl CleanupPolicy {
    fn pressure_bytes(&self) -> u64 {
        (self.quota_bytes as f64 * self.pressure_threshold) as u64
    }
}

impl From<&StorageSettings> for CleanupPolicy {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            max_age_secs: settings.max_age_secs,
            quota_bytes: settings.quota_bytes,
            pressure_threshold: settings.pressure_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageQuota {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub available_bytes: u64,
    /// used / quota
    pub usage_ratio: f64,
    pub pressure_threshold: f64,
    pub under_pressure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageAnalytics {
    pub usage: StorageUsage,
    pub quota: StorageQuota,
    pub queue: QueueStats,
    pub breakdown: Vec<StatusUsage>,
    /// Terminal jobs cleanup may remove
    pub reclaimable_jobs: usize,
    pub reclaimable_bytes: u64,
    pub retry: RetryStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed_job_ids: Vec<String>,
    pub removed_by_age: usize,
    pub removed_by_pressure: usize,
    pub freed_bytes: u64,
    pub used_before: u64,
    pub used_after: u64,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.removed_job_ids.len()
    }
}

/// Whether new data fits in the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityCheck {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub incoming_bytes: u64,
    pub fits: bool,
}

pub struct StorageManager {
    store: Arc<dyn JobStore>,
    media: Arc<MediaManager>,
    retry_policy: Arc<RetryPolicy>,
    bus: Arc<EventBus>,
    policy: RwLock<CleanupPolicy>,
}

impl StorageManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        media: Arc<MediaManager>,
        retry_policy: Arc<RetryPolicy>,
        bus: Arc<EventBus>,
        policy: CleanupPolicy,
    ) -> Self {
        Self {
            store,
            media,
            retry_policy,
            bus,
            policy: RwLock::new(policy),
        }
    }

    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.policy.read().unwrap().clone()
    }

    pub fn set_cleanup_policy(&self, policy: CleanupPolicy) {
        info!(
            "Cleanup policy set: max age {}s, quota {:#}, pressure at {:.0}%",
            policy.max_age_secs,
            Byte::from(policy.quota_bytes),
            policy.pressure_threshold * 100.0
        );
        *self.policy.write().unwrap() = policy;
    }

    pub fn get_storage_quota(&self) -> Result<StorageQuota> {
        let policy = self.cleanup_policy();
        let used_bytes = self.store.storage_usage()?.total_bytes();
        Ok(quota_from(used_bytes, &policy))
    }

    pub fn get_storage_breakdown(&self) -> Result<Vec<StatusUsage>> {
        self.store.storage_breakdown()
    }

    pub fn get_analytics(&self) -> Result<StorageAnalytics> {
        let policy = self.cleanup_policy();
        let usage = self.store.storage_usage()?;
        let candidates = self.store.cleanup_candidates(None)?;
        metrics::update_storage_usage(usage.payload_bytes, usage.media_bytes);

        Ok(StorageAnalytics {
            quota: quota_from(usage.total_bytes(), &policy),
            queue: self.store.stats()?,
            breakdown: self.store.storage_breakdown()?,
            reclaimable_jobs: candidates.len(),
            reclaimable_bytes: candidates.iter().map(|c| c.bytes).sum(),
            retry: self.retry_policy.get_stats(),
            usage,
        })
    }

    /// True when usage is above the pressure threshold or some terminal job
    /// is past the age limit.
    pub fn should_perform_cleanup(&self) -> Result<bool> {
        let policy = self.cleanup_policy();
        let used = self.store.storage_usage()?.total_bytes();
        if used >= policy.pressure_bytes() {
            return Ok(true);
        }
        let expired = self
            .store
            .cleanup_candidates(Some(age_cutoff(&policy, now_millis())))?;
        Ok(!expired.is_empty())
    }

    pub fn check_capacity(&self, incoming_bytes: u64) -> Result<CapacityCheck> {
        let quota_bytes = self.cleanup_policy().quota_bytes;
        let used_bytes = self.store.storage_usage()?.total_bytes();
        Ok(CapacityCheck {
            used_bytes,
            quota_bytes,
            incoming_bytes,
            fits: used_bytes.saturating_add(incoming_bytes) <= quota_bytes,
        })
    }

    pub fn perform_cleanup(&self) -> Result<CleanupReport> {
        let policy = self.cleanup_policy();
        let mut report = CleanupReport {
            used_before: self.store.storage_usage()?.total_bytes(),
            ..Default::default()
        };

        let expired = self
            .store
            .cleanup_candidates(Some(age_cutoff(&policy, now_millis())))?;
        for candidate in &expired {
            if self.remove(candidate)? {
                report.removed_by_age += 1;
                report.freed_bytes += candidate.bytes;
                report.removed_job_ids.push(candidate.job_id.clone());
            }
        }

        let target = policy.pressure_bytes();
        let mut used = self.store.storage_usage()?.total_bytes();
        if used >= target {
            debug!(
                "Storage at {:#} of {:#}, removing oldest terminal jobs",
                Byte::from(used),
                Byte::from(policy.quota_bytes)
            );
            for candidate in self.store.cleanup_candidates(None)? {
                if used < target {
                    break;
                }
                if self.remove(&candidate)? {
                    used = used.saturating_sub(candidate.bytes);
                    report.removed_by_pressure += 1;
                    report.freed_bytes += candidate.bytes;
                    report.removed_job_ids.push(candidate.job_id);
                }
            }
            if used >= target {
                warn!(
                    "Storage still above pressure threshold after cleanup ({:#}); remaining jobs are not removable",
                    Byte::from(used)
                );
            }
        }

        let after = self.store.storage_usage()?;
        report.used_after = after.total_bytes();
        metrics::record_cleanup_removed(report.removed());
        metrics::update_storage_usage(after.payload_bytes, after.media_bytes);

        if report.removed() > 0 {
            info!(
                "Cleanup removed {} jobs ({} by age, {} by pressure), freed {:#}",
                report.removed(),
                report.removed_by_age,
                report.removed_by_pressure,
                Byte::from(report.freed_bytes)
            );
        }
        Ok(report)
    }

    fn remove(&self, candidate: &CleanupCandidate) -> Result<bool> {
        if candidate.status.is_protected() {
            return Ok(false);
        }
        if !self.store.delete_job(&candidate.job_id)? {
            return Ok(false);
        }
        if let Err(e) = self.media.cleanup_job(&candidate.job_id) {
            warn!(
                "Failed to release media handles of job {}: {:#}",
                candidate.job_id, e
            );
        }
        self.retry_policy.forget(&candidate.job_id);
        self.bus.publish(JobEvent::Removed {
            job_id: candidate.job_id.clone(),
        });
        debug!("Removed {} job {}", candidate.status, candidate.job_id);
        Ok(true)
    }

    /// Run cleanup every `interval` while it is needed, until `shutdown`.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.should_perform_cleanup() {
                            Ok(true) => {
                                if let Err(e) = manager.perform_cleanup() {
                                    error!("Storage cleanup failed: {:#}", e);
                                }
                            }
                            Ok(false) => debug!("No storage cleanup needed"),
                            Err(e) => error!("Failed to check storage usage: {:#}", e),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Cleanup task stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn age_cutoff(policy: &CleanupPolicy, now: i64) -> i64 {
    now - (policy.max_age_secs as i64).saturating_mul(1000)
}

fn quota_from(used_bytes: u64, policy: &CleanupPolicy) -> StorageQuota {
    let usage_ratio = if policy.quota_bytes == 0 {
        1.0
    } else {
        used_bytes as f64 / policy.quota_bytes as f64
    };
    StorageQuota {
        used_bytes,
        quota_bytes: policy.quota_bytes,
        available_bytes: policy.quota_bytes.saturating_sub(used_bytes),
        usage_ratio,
        pressure_threshold: policy.pressure_threshold,
        under_pressure: used_bytes >= policy.pressure_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use crate::sync_queue::event_bus::JobEventKind;
    use crate::sync_queue::job_store::SqliteJobStore;
    use crate::sync_queue::models::{
        Job, JobError, JobErrorType, JobKind, JobStatus, NewJob, NewMedia,
    };
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<SqliteJobStore>,
        media: Arc<MediaManager>,
        bus: Arc<EventBus>,
        manager: StorageManager,
    }

    fn fixture(policy: CleanupPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let media = Arc::new(MediaManager::new(store.clone(), dir.path().join("media")).unwrap());
        let bus = EventBus::new();
        let manager = StorageManager::new(
            store.clone(),
            media.clone(),
            Arc::new(RetryPolicy::new(&RetrySettings::default())),
            bus.clone(),
            policy,
        );
        Fixture {
            _dir: dir,
            store,
            media,
            bus,
            manager,
        }
    }

    fn policy(max_age_secs: u64, quota_bytes: u64, pressure_threshold: f64) -> CleanupPolicy {
        CleanupPolicy {
            max_age_secs,
            quota_bytes,
            pressure_threshold,
        }
    }

    fn add(store: &SqliteJobStore, n: u32, media_bytes: usize) -> Job {
        store
            .add_job(NewJob {
                kind: JobKind::SubmitWork,
                payload: serde_json::json!({ "n": n }),
                content_hash: format!("h{}", n),
                media: vec![NewMedia::new(vec![0u8; media_bytes])],
            })
            .unwrap()
    }

    fn sync(store: &SqliteJobStore, job: &Job) {
        store.claim_for_processing(&job.id).unwrap();
        store.mark_synced(&job.id, &format!("0x{}", job.id)).unwrap();
    }

    fn fail_terminal(store: &SqliteJobStore, job: &Job) {
        store.claim_for_processing(&job.id).unwrap();
        store
            .mark_failed(
                &job.id,
                &JobError::new(JobErrorType::Rejected, "denied"),
                true,
                None,
            )
            .unwrap();
    }

    fn ms(n: u64) {
        std::thread::sleep(Duration::from_millis(n));
    }

    #[test]
    fn test_check_capacity() {
        let f = fixture(policy(3600, 1000, 0.8));
        add(&f.store, 1, 500);

        let check = f.manager.check_capacity(100).unwrap();
        assert!(check.fits);
        assert_eq!(check.quota_bytes, 1000);
        assert!(check.used_bytes >= 500);

        let check = f.manager.check_capacity(600).unwrap();
        assert!(!check.fits);
        assert_eq!(check.incoming_bytes, 600);
    }

    #[test]
    fn test_quota_and_pressure() {
        let f = fixture(policy(3600, 1000, 0.5));
        let quota = f.manager.get_storage_quota().unwrap();
        assert_eq!(quota.used_bytes, 0);
        assert_eq!(quota.available_bytes, 1000);
        assert!(!quota.under_pressure);
        assert!(!f.manager.should_perform_cleanup().unwrap());

        add(&f.store, 1, 600);
        let quota = f.manager.get_storage_quota().unwrap();
        assert!(quota.under_pressure);
        assert!(quota.usage_ratio > 0.5);
        assert!(f.manager.should_perform_cleanup().unwrap());
    }

    #[test]
    fn test_age_cleanup_removes_only_terminal_jobs() {
        let f = fixture(policy(0, 1_000_000, 0.9));
        let synced = add(&f.store, 1, 10);
        let failed = add(&f.store, 2, 10);
        let pending = add(&f.store, 3, 10);
        let retryable = add(&f.store, 4, 10);
        sync(&f.store, &synced);
        fail_terminal(&f.store, &failed);
        f.store.claim_for_processing(&retryable.id).unwrap();
        f.store
            .mark_failed(
                &retryable.id,
                &JobError::new(JobErrorType::Transport, "offline"),
                false,
                Some(now_millis() + 60_000),
            )
            .unwrap();
        ms(5);

        assert!(f.manager.should_perform_cleanup().unwrap());
        let report = f.manager.perform_cleanup().unwrap();
        assert_eq!(report.removed_by_age, 2);
        assert_eq!(report.removed_by_pressure, 0);
        assert!(report.removed_job_ids.contains(&synced.id));
        assert!(report.removed_job_ids.contains(&failed.id));
        assert!(report.freed_bytes > 0);
        assert!(report.used_after < report.used_before);

        assert!(f.store.get_job(&synced.id).unwrap().is_none());
        assert!(f.store.get_job(&pending.id).unwrap().is_some());
        assert_eq!(
            f.store.get_job(&retryable.id).unwrap().unwrap().status,
            JobStatus::FailedRetryable
        );
        // Media went with the job
        assert!(f.store.get_media(&synced.media_refs[0]).unwrap().is_none());
    }

    #[test]
    fn test_young_terminal_jobs_survive_without_pressure() {
        let f = fixture(policy(3600, 1_000_000, 0.9));
        let synced = add(&f.store, 1, 10);
        sync(&f.store, &synced);

        assert!(!f.manager.should_perform_cleanup().unwrap());
        let report = f.manager.perform_cleanup().unwrap();
        assert_eq!(report.removed(), 0);
        assert!(f.store.get_job(&synced.id).unwrap().is_some());
    }

    #[test]
    fn test_pressure_cleanup_removes_oldest_first() {
        let f = fixture(policy(3600, 2500, 1.0));
        let oldest = add(&f.store, 1, 1000);
        sync(&f.store, &oldest);
        ms(3);
        let middle = add(&f.store, 2, 1000);
        sync(&f.store, &middle);
        ms(3);
        let newest = add(&f.store, 3, 1000);
        sync(&f.store, &newest);

        let report = f.manager.perform_cleanup().unwrap();
        assert_eq!(report.removed_job_ids, vec![oldest.id.clone()]);
        assert_eq!(report.removed_by_pressure, 1);
        assert!(report.used_after < 2500);
        assert!(f.store.get_job(&middle.id).unwrap().is_some());
        assert!(f.store.get_job(&newest.id).unwrap().is_some());
    }

    #[test]
    fn test_pressure_never_removes_pending_jobs() {
        let f = fixture(policy(0, 100, 0.5));
        let pending = add(&f.store, 1, 3000);
        ms(3);

        let report = f.manager.perform_cleanup().unwrap();
        assert_eq!(report.removed(), 0);
        assert!(f.store.get_job(&pending.id).unwrap().is_some());
        assert!(!f.manager.check_capacity(1).unwrap().fits);
    }

    #[test]
    fn test_removal_publishes_events_and_releases_media() {
        let f = fixture(policy(0, 1_000_000, 0.9));
        let job = add(&f.store, 1, 64);
        let handle = f.media.create_url(&job.media_refs[0]).unwrap();
        sync(&f.store, &job);
        ms(5);

        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let _sub = f.bus.subscribe_kind(JobEventKind::Removed, move |event| {
            sink.lock().unwrap().push(event.job_id().to_string());
        });

        f.manager.perform_cleanup().unwrap();
        assert_eq!(*removed.lock().unwrap(), vec![job.id.clone()]);
        assert!(!handle.path.exists());
        assert_eq!(f.media.live_handles(), 0);
    }

    #[test]
    fn test_set_cleanup_policy() {
        let f = fixture(policy(3600, 1000, 0.8));
        f.manager.set_cleanup_policy(policy(60, 5000, 0.5));
        let current = f.manager.cleanup_policy();
        assert_eq!(current.quota_bytes, 5000);
        assert_eq!(f.manager.get_storage_quota().unwrap().quota_bytes, 5000);
    }

    #[test]
    fn test_analytics() {
        let f = fixture(policy(3600, 1_000_000, 0.8));
        let synced = add(&f.store, 1, 100);
        sync(&f.store, &synced);
        add(&f.store, 2, 200);

        let analytics = f.manager.get_analytics().unwrap();
        assert_eq!(analytics.usage.job_count, 2);
        assert_eq!(analytics.usage.media_bytes, 300);
        assert_eq!(analytics.queue.pending, 1);
        assert_eq!(analytics.queue.synced, 1);
        assert_eq!(analytics.reclaimable_jobs, 1);
        assert!(analytics.reclaimable_bytes >= 100);
        assert!(!analytics.breakdown.is_empty());
    }

    #[test]
    fn test_cleanup_policy_from_settings() {
        let settings = StorageSettings::default();
        let policy = CleanupPolicy::from(&settings);
        assert_eq!(policy.quota_bytes, settings.quota_bytes);
        assert_eq!(policy.max_age_secs, settings.max_age_secs);
    }

    #[tokio::test]
    async fn test_cleanup_task_runs_until_shutdown() {
        let f = fixture(policy(0, 1_000_000, 0.9));
        let job = add(&f.store, 1, 10);
        sync(&f.store, &job);

        let manager = Arc::new(f.manager);
        let shutdown = CancellationToken::new();
        let handle = manager.spawn_cleanup_task(Duration::from_millis(20), shutdown.clone());

        let mut removed = false;
        for _ in 0..100 {
            if f.store.get_job(&job.id).unwrap().is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
