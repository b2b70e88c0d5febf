//! Duplicate detection for incoming jobs.
//!
//! Content fingerprints are SHA-256 digests of a canonical JSON rendering of
//! the payload with volatile keys removed. A new payload is compared against
//! local jobs, then against records already confirmed remotely, and finally
//! (when enabled) against recent jobs whose selected fields mostly match.

use super::clients::{RemoteQuery, RemoteReader};
use super::job_store::JobStore;
use super::models::{now_millis, Job, JobFilter, JobKind, JobStatus};
use crate::config::DedupSettings;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Statuses that count as "still in the queue" for duplicate detection.
const ACTIVE_STATUSES: [JobStatus; 3] = [
    JobStatus::Pending,
    JobStatus::Processing,
    JobStatus::FailedRetryable,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    /// Same content fingerprint
    SameContent,
    /// Selected fields match above the similarity threshold
    SimilarFields,
}

/// An existing job or remote record that a new payload collides with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub source: MatchSource,
    pub reason: MatchReason,
    /// Local job id or remote record id
    pub id: String,
    /// Status of the local job, None for remote records
    pub status: Option<JobStatus>,
    pub created_at: i64,
    /// 1.0 for identical content
    pub similarity: f64,
}

impl DuplicateMatch {
    fn local(job: &Job, reason: MatchReason, similarity: f64) -> Self {
        Self {
            source: MatchSource::Local,
            reason,
            id: job.id.clone(),
            status: Some(job.status),
            created_at: job.created_at,
            similarity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", content = "matches", rename_all = "snake_case")]
pub enum DuplicateVerdict {
    Unique,
    /// The payload must not be queued again
    ExactDuplicate(DuplicateMatch),
    /// The payload may be queued, the matches are reported to the caller
    Similar(Vec<DuplicateMatch>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCheck {
    pub content_hash: String,
    pub verdict: DuplicateVerdict,
}

pub struct DeduplicationManager {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteReader>,
    settings: DedupSettings,
}

impl DeduplicationManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteReader>,
        settings: DedupSettings,
    ) -> Self {
        Self {
            store,
            remote,
            settings,
        }
    }

    pub fn settings(&self) -> &DedupSettings {
        &self.settings
    }

    /// Stable fingerprint of a payload: `sha256:<hex>`.
    pub fn generate_content_hash(&self, payload: &Value) -> String {
        let mut canonical = String::new();
        self.write_canonical(payload, &mut canonical);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }

    /// Compact JSON with sorted keys and volatile keys dropped at any depth.
    fn write_canonical(&self, value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let keys: BTreeSet<&String> = map
                    .keys()
                    .filter(|k| !self.is_volatile(k))
                    .collect();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    self.write_canonical(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_canonical(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }

    fn is_volatile(&self, key: &str) -> bool {
        self.settings.volatile_fields.iter().any(|f| f == key)
    }

    /// Exact duplicate among local jobs of the same kind: anything still
    /// queued, or synced within the window.
    pub fn check_local_duplicate(
        &self,
        kind: &JobKind,
        content_hash: &str,
    ) -> Result<Option<DuplicateMatch>> {
        self.check_local_duplicate_at(kind, content_hash, now_millis())
    }

    fn check_local_duplicate_at(
        &self,
        kind: &JobKind,
        content_hash: &str,
        now: i64,
    ) -> Result<Option<DuplicateMatch>> {
        let window_start = now - self.settings.window_millis();
        let jobs = self.store.get_jobs(&JobFilter {
            kind: Some(kind.clone()),
            content_hash: Some(content_hash.to_string()),
            oldest_first: true,
            ..Default::default()
        })?;

        Ok(jobs
            .iter()
            .find(|job| {
                ACTIVE_STATUSES.contains(&job.status)
                    || (job.status == JobStatus::Synced && job.created_at >= window_start)
            })
            .map(|job| DuplicateMatch::local(job, MatchReason::SameContent, 1.0)))
    }

    /// Exact duplicate among records of the same kind confirmed remotely
    /// within `window_millis`.
    ///
    /// Remote failures are logged and treated as "no duplicate".
    pub async fn check_remote_duplicate(
        &self,
        kind: &JobKind,
        content_hash: &str,
        window_millis: i64,
    ) -> Option<DuplicateMatch> {
        self.check_remote_duplicate_at(kind, content_hash, window_millis, now_millis())
            .await
    }

    async fn check_remote_duplicate_at(
        &self,
        kind: &JobKind,
        content_hash: &str,
        window_millis: i64,
        now: i64,
    ) -> Option<DuplicateMatch> {
        let since = now - window_millis;
        let query = RemoteQuery {
            since: Some(since),
            content_hash: Some(content_hash.to_string()),
            limit: Some(10),
        };
        let records = match self.remote.fetch_confirmed(&query).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Remote duplicate check failed, assuming unique: {}", e);
                return None;
            }
        };

        records
            .into_iter()
            .filter(|r| r.created_at >= since && r.kind == *kind)
            .find(|r| {
                let hash = r
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| self.generate_content_hash(&r.payload));
                hash == content_hash
            })
            .map(|r| DuplicateMatch {
                source: MatchSource::Remote,
                reason: MatchReason::SameContent,
                id: r.remote_id,
                status: None,
                created_at: r.created_at,
                similarity: 1.0,
            })
    }

    /// Classify a payload as exact duplicate, similar, or unique.
    pub async fn perform_comprehensive_check(
        &self,
        kind: &JobKind,
        payload: &Value,
    ) -> Result<DuplicateCheck> {
        self.perform_comprehensive_check_at(kind, payload, now_millis())
            .await
    }

    async fn perform_comprehensive_check_at(
        &self,
        kind: &JobKind,
        payload: &Value,
        now: i64,
    ) -> Result<DuplicateCheck> {
        let content_hash = self.generate_content_hash(payload);

        if let Some(existing) = self.check_local_duplicate_at(kind, &content_hash, now)? {
            debug!("Payload {} duplicates local job {}", content_hash, existing.id);
            return Ok(DuplicateCheck {
                content_hash,
                verdict: DuplicateVerdict::ExactDuplicate(existing),
            });
        }

        if self.settings.remote_check_enabled {
            if let Some(existing) = self
                .check_remote_duplicate_at(
                    kind,
                    &content_hash,
                    self.settings.window_millis(),
                    now,
                )
                .await
            {
                debug!(
                    "Payload {} duplicates remote record {}",
                    content_hash, existing.id
                );
                return Ok(DuplicateCheck {
                    content_hash,
                    verdict: DuplicateVerdict::ExactDuplicate(existing),
                });
            }
        }

        // Same content, synced before the window: kept, but reported
        let mut matches: Vec<DuplicateMatch> = self
            .store
            .get_jobs(&JobFilter {
                statuses: vec![JobStatus::Synced],
                kind: Some(kind.clone()),
                content_hash: Some(content_hash.clone()),
                ..Default::default()
            })?
            .iter()
            .map(|job| DuplicateMatch::local(job, MatchReason::SameContent, 1.0))
            .collect();

        if self.settings.similarity_enabled {
            matches.extend(self.find_similar(kind, payload, &content_hash, now)?);
        }

        let verdict = if matches.is_empty() {
            DuplicateVerdict::Unique
        } else {
            DuplicateVerdict::Similar(matches)
        };
        Ok(DuplicateCheck {
            content_hash,
            verdict,
        })
    }

    fn find_similar(
        &self,
        kind: &JobKind,
        payload: &Value,
        content_hash: &str,
        now: i64,
    ) -> Result<Vec<DuplicateMatch>> {
        let candidates = self.store.get_jobs(&JobFilter {
            statuses: vec![
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::FailedRetryable,
                JobStatus::Synced,
            ],
            kind: Some(kind.clone()),
            created_after: Some(now - self.settings.window_millis()),
            ..Default::default()
        })?;

        let mut matches: Vec<DuplicateMatch> = candidates
            .iter()
            .filter(|job| job.content_hash != content_hash)
            .filter_map(|job| {
                let score = self.similarity(payload, &job.payload);
                (score >= self.settings.similarity_threshold)
                    .then(|| DuplicateMatch::local(job, MatchReason::SimilarFields, score))
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(matches)
    }

    /// Fraction of compared keys whose canonical values are equal.
    pub fn similarity(&self, a: &Value, b: &Value) -> f64 {
        let (Value::Object(a_map), Value::Object(b_map)) = (a, b) else {
            return if self.canonical(a) == self.canonical(b) {
                1.0
            } else {
                0.0
            };
        };

        let keys: BTreeSet<&str> = if self.settings.similarity_fields.is_empty() {
            a_map
                .keys()
                .chain(b_map.keys())
                .map(String::as_str)
                .filter(|k| !self.is_volatile(k))
                .collect()
        } else {
            self.settings
                .similarity_fields
                .iter()
                .map(String::as_str)
                .collect()
        };
        if keys.is_empty() {
            return 0.0;
        }

        let equal = keys
            .iter()
            .filter(|k| match (a_map.get(**k), b_map.get(**k)) {
                (Some(x), Some(y)) => self.canonical(x) == self.canonical(y),
                _ => false,
            })
            .count();
        equal as f64 / keys.len() as f64
    }

    fn canonical(&self, value: &Value) -> String {
        let mut out = String::new();
        self.write_canonical(value, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityMode;
    use crate::sync_queue::clients::{NoRemoteReader, RemoteRecord};
    use crate::sync_queue::job_store::SqliteJobStore;
    use crate::sync_queue::models::NewJob;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticReader(Vec<RemoteRecord>);

    #[async_trait]
    impl RemoteReader for StaticReader {
        async fn fetch_confirmed(&self, _query: &RemoteQuery) -> Result<Vec<RemoteRecord>> {
            Ok(self.0.clone())
        }
    }

    struct FailingReader;

    #[async_trait]
    impl RemoteReader for FailingReader {
        async fn fetch_confirmed(&self, _query: &RemoteQuery) -> Result<Vec<RemoteRecord>> {
            anyhow::bail!("remote unreachable")
        }
    }

    fn settings() -> DedupSettings {
        DedupSettings {
            window_secs: 600,
            ..Default::default()
        }
    }

    fn manager_with(
        remote: Arc<dyn RemoteReader>,
        settings: DedupSettings,
    ) -> (Arc<SqliteJobStore>, DeduplicationManager) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let manager = DeduplicationManager::new(store.clone(), remote, settings);
        (store, manager)
    }

    fn add(store: &SqliteJobStore, manager: &DeduplicationManager, payload: Value) -> Job {
        store
            .add_job(NewJob {
                kind: JobKind::SubmitWork,
                content_hash: manager.generate_content_hash(&payload),
                payload,
                media: vec![],
            })
            .unwrap()
    }

    #[test]
    fn test_hash_ignores_key_order_and_volatile_fields() {
        let (_, manager) = manager_with(Arc::new(NoRemoteReader), settings());

        let a = json!({"site": "north", "hours": 4, "timestamp": 1, "meta": {"nonce": 7, "x": [1, 2]}});
        let b = json!({"meta": {"x": [1, 2], "nonce": 99}, "hours": 4, "site": "north", "timestamp": 2});
        let c = json!({"site": "north", "hours": 5});

        let hash = manager.generate_content_hash(&a);
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
        assert_eq!(hash, manager.generate_content_hash(&b));
        assert_ne!(hash, manager.generate_content_hash(&c));
    }

    #[test]
    fn test_hash_array_order_matters() {
        let (_, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        assert_ne!(
            manager.generate_content_hash(&json!({"x": [1, 2]})),
            manager.generate_content_hash(&json!({"x": [2, 1]}))
        );
    }

    #[test]
    fn test_local_duplicate_of_pending_job() {
        let (store, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        let job = add(&store, &manager, json!({"a": 1}));

        let found = manager
            .check_local_duplicate(&JobKind::SubmitWork, &job.content_hash)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.status, Some(JobStatus::Pending));
        assert!(manager
            .check_local_duplicate(&JobKind::SubmitWork, "sha256:other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_terminal_failure_is_not_a_duplicate() {
        let (store, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        let job = add(&store, &manager, json!({"a": 1}));
        let err = crate::sync_queue::models::JobError::new(
            crate::sync_queue::models::JobErrorType::Validation,
            "bad",
        );
        store.mark_failed(&job.id, &err, true, None).unwrap();

        assert!(manager
            .check_local_duplicate(&JobKind::SubmitWork, &job.content_hash)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_synced_inside_window_is_exact_duplicate() {
        let (store, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        let payload = json!({"a": 1});
        let job = add(&store, &manager, payload.clone());
        store.mark_synced(&job.id, "0x1").unwrap();

        // Two minutes later, ten minute window
        let check = manager
            .perform_comprehensive_check_at(&JobKind::SubmitWork, &payload, job.created_at + 120_000)
            .await
            .unwrap();
        match check.verdict {
            DuplicateVerdict::ExactDuplicate(m) => assert_eq!(m.id, job.id),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_synced_outside_window_is_similar() {
        let (store, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        let payload = json!({"a": 1});
        let job = add(&store, &manager, payload.clone());
        store.mark_synced(&job.id, "0x1").unwrap();

        let check = manager
            .perform_comprehensive_check_at(
                &JobKind::SubmitWork,
                &payload,
                job.created_at + 601_000,
            )
            .await
            .unwrap();
        match check.verdict {
            DuplicateVerdict::Similar(matches) => {
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].id, job.id);
                assert_eq!(matches[0].reason, MatchReason::SameContent);
            }
            other => panic!("expected similar, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_duplicate_inside_window() {
        let payload = json!({"a": 1});
        let (_, hasher) = manager_with(Arc::new(NoRemoteReader), settings());
        let hash = hasher.generate_content_hash(&payload);
        let now = now_millis();

        let reader = StaticReader(vec![
            RemoteRecord {
                remote_id: "0xold".to_string(),
                kind: JobKind::SubmitWork,
                payload: payload.clone(),
                content_hash: Some(hash.clone()),
                created_at: now - 3_600_000,
            },
            RemoteRecord {
                remote_id: "0xnew".to_string(),
                kind: JobKind::SubmitWork,
                // No hash attached: computed from the payload
                payload: payload.clone(),
                content_hash: None,
                created_at: now - 60_000,
            },
        ]);
        let (_, manager) = manager_with(Arc::new(reader), settings());

        let found = manager
            .check_remote_duplicate_at(&JobKind::SubmitWork, &hash, 600_000, now)
            .await
            .unwrap();
        assert_eq!(found.id, "0xnew");
        assert_eq!(found.source, MatchSource::Remote);
    }

    #[tokio::test]
    async fn test_same_payload_of_another_kind_is_unique() {
        let payload = json!({"site": "north", "hours": 4});
        let (_, hasher) = manager_with(Arc::new(NoRemoteReader), settings());
        let reader = StaticReader(vec![RemoteRecord {
            remote_id: "0xwork".to_string(),
            kind: JobKind::SubmitWork,
            payload: payload.clone(),
            content_hash: Some(hasher.generate_content_hash(&payload)),
            created_at: now_millis() - 60_000,
        }]);
        let (store, manager) = manager_with(Arc::new(reader), settings());
        let work = add(&store, &manager, payload.clone());

        assert!(manager
            .check_local_duplicate(&JobKind::SubmitApproval, &work.content_hash)
            .unwrap()
            .is_none());
        assert!(manager
            .check_remote_duplicate(&JobKind::SubmitApproval, &work.content_hash, 600_000)
            .await
            .is_none());

        let check = manager
            .perform_comprehensive_check(&JobKind::SubmitApproval, &payload)
            .await
            .unwrap();
        assert_eq!(check.verdict, DuplicateVerdict::Unique);

        let check = manager
            .perform_comprehensive_check(&JobKind::SubmitWork, &payload)
            .await
            .unwrap();
        assert!(matches!(check.verdict, DuplicateVerdict::ExactDuplicate(_)));
    }

    #[tokio::test]
    async fn test_remote_failure_is_not_duplicate() {
        let (_, manager) = manager_with(Arc::new(FailingReader), settings());
        let check = manager
            .perform_comprehensive_check(&JobKind::SubmitWork, &json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(check.verdict, DuplicateVerdict::Unique);
    }

    #[test]
    fn test_similarity_score() {
        let (_, manager) = manager_with(Arc::new(NoRemoteReader), settings());
        let a = json!({"site": "north", "hours": 4, "crew": "b", "notes": "x", "timestamp": 1});
        let b = json!({"site": "north", "hours": 4, "crew": "b", "notes": "y", "timestamp": 2});
        assert_eq!(manager.similarity(&a, &b), 0.75);
        assert_eq!(manager.similarity(&json!(1), &json!(1)), 1.0);

        let subset = DedupSettings {
            similarity_fields: vec!["site".to_string(), "hours".to_string()],
            ..settings()
        };
        let (_, manager) = manager_with(Arc::new(NoRemoteReader), subset);
        assert_eq!(manager.similarity(&a, &b), 1.0);
    }

    #[tokio::test]
    async fn test_fuzzy_similarity_reported() {
        let fuzzy = DedupSettings {
            similarity_enabled: true,
            similarity_fields: vec!["site".to_string(), "hours".to_string()],
            similarity_threshold: 1.0,
            similarity_mode: SimilarityMode::Block,
            ..settings()
        };
        let (store, manager) = manager_with(Arc::new(NoRemoteReader), fuzzy);
        let existing = add(&store, &manager, json!({"site": "north", "hours": 4, "notes": "a"}));

        let check = manager
            .perform_comprehensive_check(
                &JobKind::SubmitWork,
                &json!({"site": "north", "hours": 4, "notes": "b"}),
            )
            .await
            .unwrap();
        match check.verdict {
            DuplicateVerdict::Similar(matches) => {
                assert_eq!(matches[0].id, existing.id);
                assert_eq!(matches[0].reason, MatchReason::SimilarFields);
            }
            other => panic!("expected similar, got {:?}", other),
        }

        // Different kind is never compared
        let check = manager
            .perform_comprehensive_check(
                &JobKind::SubmitApproval,
                &json!({"site": "north", "hours": 4, "notes": "b"}),
            )
            .await
            .unwrap();
        assert_eq!(check.verdict, DuplicateVerdict::Unique);
    }
}
