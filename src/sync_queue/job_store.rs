//! Job queue storage and persistence.
//!
//! Provides SQLite-backed, crash-consistent storage for queued jobs and their
//! media blobs. Every mutation goes through one mutex-guarded connection, so
//! concurrent callers never lose updates.

use super::models::*;
use super::schema::JOB_QUEUE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Trait for job queue storage operations.
pub trait JobStore: Send + Sync {
    // === Queue Management ===

    /// Persist a new job and its media atomically. The job starts PENDING.
    fn add_job(&self, job: NewJob) -> Result<Job>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// List jobs matching a filter.
    fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Apply a partial update. Terminal jobs cannot be updated and the
    /// attempt count can never decrease.
    fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job>;

    /// Delete a job and its media. Returns false if it did not exist.
    fn delete_job(&self, id: &str) -> Result<bool>;

    // === State Transitions (atomic) ===

    /// Atomically claim a job for processing (PENDING → PROCESSING),
    /// incrementing its attempt count. Returns false if not pending.
    fn claim_for_processing(&self, id: &str) -> Result<bool>;

    /// Mark a job as synced with the identifier returned by the remote.
    fn mark_synced(&self, id: &str, remote_id: &str) -> Result<()>;

    /// Record a failed attempt, either retryable (with the next retry time)
    /// or terminal.
    fn mark_failed(
        &self,
        id: &str,
        error: &JobError,
        terminal: bool,
        next_retry_at: Option<i64>,
    ) -> Result<()>;

    // === Retry Handling ===

    /// Move FAILED_RETRYABLE jobs whose retry time has passed back to PENDING.
    /// Returns the promoted ids.
    fn promote_retry_ready(&self, now: i64) -> Result<Vec<String>>;

    /// Return jobs left in PROCESSING by an interrupted process to PENDING.
    fn reset_interrupted(&self) -> Result<usize>;

    // === Cleanup ===

    /// Delete synced jobs, optionally only those synced before `older_than`.
    /// Returns the removed ids.
    fn clear_synced(&self, older_than: Option<i64>) -> Result<Vec<String>>;

    /// Terminal jobs eligible for cleanup, oldest first.
    fn cleanup_candidates(&self, older_than: Option<i64>) -> Result<Vec<CleanupCandidate>>;

    // === Media ===

    fn get_media(&self, blob_id: &str) -> Result<Option<MediaBlob>>;

    /// Media of a job in attachment order.
    fn get_job_media(&self, job_id: &str) -> Result<Vec<MediaBlob>>;

    // === Statistics ===

    fn stats(&self) -> Result<QueueStats>;

    fn storage_usage(&self) -> Result<StorageUsage>;

    fn storage_breakdown(&self) -> Result<Vec<StatusUsage>>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(&db_path, JOB_QUEUE_VERSIONED_SCHEMAS, "job queue")?;
        Self::configure(&conn)?;
        info!("Opened job queue database at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store, used by tests and ephemeral sessions.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        // journal_mode returns a row, so it cannot go through execute()
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = FULL;", [])?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Job store connection mutex poisoned"))
    }

    fn json_error(idx: usize, e: serde_json::Error) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    }

    /// Helper to convert a database row to a Job.
    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let payload: String = row.get("payload")?;
        let media_refs: String = row.get("media_refs")?;
        let status: String = row.get("status")?;
        let last_error = match (
            row.get::<_, Option<String>>("last_error_type")?,
            row.get::<_, Option<String>>("last_error")?,
        ) {
            (Some(error_type), Some(message)) => JobErrorType::from_str(&error_type)
                .map(|error_type| JobError::new(error_type, message)),
            _ => None,
        };

        Ok(Job {
            id: row.get("id")?,
            kind: JobKind::parse(&row.get::<_, String>("kind")?),
            payload: serde_json::from_str(&payload).map_err(|e| Self::json_error(2, e))?,
            status: JobStatus::from_db_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    Type::Text,
                    format!("unknown job status {}", status).into(),
                )
            })?,
            attempt_count: row.get("attempt_count")?,
            last_attempt_at: row.get("last_attempt_at")?,
            last_error,
            next_retry_at: row.get("next_retry_at")?,
            content_hash: row.get("content_hash")?,
            media_refs: serde_json::from_str(&media_refs).map_err(|e| Self::json_error(10, e))?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            remote_id: row.get("remote_id")?,
            synced_at: row.get("synced_at")?,
        })
    }

    fn row_to_media(row: &rusqlite::Row) -> rusqlite::Result<MediaBlob> {
        Ok(MediaBlob {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            position: row.get("position")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get::<_, i64>("size_bytes")? as u64,
            data: row.get("data")?,
            created_at: row.get("created_at")?,
        })
    }

    fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn load_mutable_job(conn: &Connection, id: &str) -> Result<Job> {
        let job = Self::load_job(conn, id)?.ok_or_else(|| anyhow!("Job {} not found", id))?;
        if job.is_terminal() {
            bail!(
                "Job {} is {} and can no longer be modified",
                id,
                job.status.as_str()
            );
        }
        Ok(job)
    }
}

impl JobStore for SqliteJobStore {
    fn add_job(&self, new_job: NewJob) -> Result<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let media_refs: Vec<String> = new_job
            .media
            .iter()
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect();
        let payload = serde_json::to_string(&new_job.payload)?;

        tx.execute(
            r#"INSERT INTO jobs (
                id, kind, payload, status, attempt_count, content_hash,
                media_refs, created_at, updated_at, seq
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs))"#,
            params![
                id,
                new_job.kind.as_str(),
                payload,
                JobStatus::Pending.as_db_str(),
                new_job.content_hash,
                serde_json::to_string(&media_refs)?,
                now,
            ],
        )?;

        for (position, (blob_id, media)) in media_refs.iter().zip(&new_job.media).enumerate() {
            tx.execute(
                r#"INSERT INTO media_blobs (id, job_id, position, mime_type, size_bytes, data, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    blob_id,
                    id,
                    position as i64,
                    media.resolved_mime_type(),
                    media.data.len() as i64,
                    media.data,
                    now,
                ],
            )?;
        }

        tx.commit().context("Failed to commit new job")?;
        debug!(
            "Stored job {} ({}) with {} media blobs",
            id,
            new_job.kind,
            media_refs.len()
        );

        Ok(Job {
            id,
            kind: new_job.kind,
            payload: new_job.payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            next_retry_at: None,
            content_hash: new_job.content_hash,
            media_refs,
            created_at: now,
            updated_at: now,
            remote_id: None,
            synced_at: None,
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        Self::load_job(&conn, id)
    }

    fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .map(|status| {
                    values.push(Box::new(status.as_db_str()));
                    format!("?{}", values.len())
                })
                .collect();
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if let Some(kind) = &filter.kind {
            values.push(Box::new(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", values.len()));
        }
        if let Some(hash) = &filter.content_hash {
            values.push(Box::new(hash.clone()));
            clauses.push(format!("content_hash = ?{}", values.len()));
        }
        if let Some(after) = filter.created_after {
            values.push(Box::new(after));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(before) = filter.created_before {
            values.push(Box::new(before));
            clauses.push(format!("created_at < ?{}", values.len()));
        }

        let mut sql = String::from("SELECT * FROM jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if filter.oldest_first {
            sql.push_str(" ORDER BY created_at ASC, seq ASC");
        } else {
            sql.push_str(" ORDER BY created_at DESC, seq DESC");
        }
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let conn = self.conn()?;
        let mut job = Self::load_mutable_job(&conn, id)?;

        if let Some(attempt_count) = patch.attempt_count {
            if attempt_count < job.attempt_count {
                bail!(
                    "Attempt count of job {} cannot decrease ({} -> {})",
                    id,
                    job.attempt_count,
                    attempt_count
                );
            }
            job.attempt_count = attempt_count;
        }
        if let Some(status) = patch.status {
            if status == JobStatus::Synced {
                bail!("Job {} can only become synced through mark_synced", id);
            }
            job.status = status;
        }
        if let Some(last_error) = patch.last_error {
            job.last_error = last_error;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            job.next_retry_at = next_retry_at;
        }
        job.updated_at = now_millis();

        conn.execute(
            r#"UPDATE jobs SET status = ?2, attempt_count = ?3, last_error_type = ?4,
                   last_error = ?5, next_retry_at = ?6, updated_at = ?7
               WHERE id = ?1"#,
            params![
                id,
                job.status.as_db_str(),
                job.attempt_count,
                job.last_error.as_ref().map(|e| e.error_type.as_str()),
                job.last_error.as_ref().map(|e| e.message.clone()),
                job.next_retry_at,
                job.updated_at,
            ],
        )?;
        Ok(job)
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn claim_for_processing(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_millis();
        let claimed = conn.execute(
            r#"UPDATE jobs SET status = ?2, attempt_count = attempt_count + 1,
                   last_attempt_at = ?3, updated_at = ?3
               WHERE id = ?1 AND status = ?4"#,
            params![
                id,
                JobStatus::Processing.as_db_str(),
                now,
                JobStatus::Pending.as_db_str(),
            ],
        )?;
        Ok(claimed == 1)
    }

    fn mark_synced(&self, id: &str, remote_id: &str) -> Result<()> {
        let conn = self.conn()?;
        Self::load_mutable_job(&conn, id)?;
        let now = now_millis();
        conn.execute(
            r#"UPDATE jobs SET status = ?2, remote_id = ?3, synced_at = ?4, updated_at = ?4,
                   next_retry_at = NULL
               WHERE id = ?1"#,
            params![id, JobStatus::Synced.as_db_str(), remote_id, now],
        )?;
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &str,
        error: &JobError,
        terminal: bool,
        next_retry_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        Self::load_mutable_job(&conn, id)?;
        let status = if terminal {
            JobStatus::FailedTerminal
        } else {
            JobStatus::FailedRetryable
        };
        conn.execute(
            r#"UPDATE jobs SET status = ?2, last_error_type = ?3, last_error = ?4,
                   next_retry_at = ?5, updated_at = ?6
               WHERE id = ?1"#,
            params![
                id,
                status.as_db_str(),
                error.error_type.as_str(),
                error.message,
                if terminal { None } else { next_retry_at },
                now_millis(),
            ],
        )?;
        Ok(())
    }

    fn promote_retry_ready(&self, now: i64) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                r#"SELECT id FROM jobs
                   WHERE status = ?1 AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                   ORDER BY created_at ASC, seq ASC"#,
            )?;
            let ids = stmt
                .query_map(
                    params![JobStatus::FailedRetryable.as_db_str(), now],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, JobStatus::Pending.as_db_str(), now],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn reset_interrupted(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE status = ?3",
            params![
                JobStatus::Pending.as_db_str(),
                now_millis(),
                JobStatus::Processing.as_db_str(),
            ],
        )?;
        Ok(count)
    }

    fn clear_synced(&self, older_than: Option<i64>) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                r#"SELECT id FROM jobs
                   WHERE status = ?1 AND (?2 IS NULL OR COALESCE(synced_at, updated_at) < ?2)"#,
            )?;
            let ids = stmt
                .query_map(params![JobStatus::Synced.as_db_str(), older_than], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        for id in &ids {
            tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn cleanup_candidates(&self, older_than: Option<i64>) -> Result<Vec<CleanupCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT j.id, j.status, j.media_refs, j.created_at,
                      LENGTH(CAST(j.payload AS BLOB))
                        + COALESCE((SELECT SUM(m.size_bytes) FROM media_blobs m WHERE m.job_id = j.id), 0)
               FROM jobs j
               WHERE j.status IN (?1, ?2) AND (?3 IS NULL OR j.updated_at < ?3)
               ORDER BY j.updated_at ASC, j.seq ASC"#,
        )?;
        let candidates = stmt
            .query_map(
                params![
                    JobStatus::Synced.as_db_str(),
                    JobStatus::FailedTerminal.as_db_str(),
                    older_than,
                ],
                |row| {
                    let status: String = row.get(1)?;
                    let media_refs: String = row.get(2)?;
                    Ok(CleanupCandidate {
                        job_id: row.get(0)?,
                        status: JobStatus::from_db_str(&status)
                            .unwrap_or(JobStatus::FailedTerminal),
                        media_refs: serde_json::from_str(&media_refs)
                            .map_err(|e| Self::json_error(2, e))?,
                        created_at: row.get(3)?,
                        bytes: row.get::<_, i64>(4)? as u64,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    fn get_media(&self, blob_id: &str) -> Result<Option<MediaBlob>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT * FROM media_blobs WHERE id = ?1",
                [blob_id],
                Self::row_to_media,
            )
            .optional()?;
        Ok(blob)
    }

    fn get_job_media(&self, job_id: &str) -> Result<Vec<MediaBlob>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM media_blobs WHERE job_id = ?1 ORDER BY position ASC")?;
        let blobs = stmt
            .query_map([job_id], Self::row_to_media)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blobs)
    }

    fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as usize;
            match JobStatus::from_db_str(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Synced) => stats.synced = count,
                Some(JobStatus::FailedRetryable) => stats.failed_retryable = count,
                Some(JobStatus::FailedTerminal) => stats.failed_terminal = count,
                None => {}
            }
        }
        stats.failed = stats.failed_retryable + stats.failed_terminal;
        Ok(stats)
    }

    fn storage_usage(&self) -> Result<StorageUsage> {
        let conn = self.conn()?;
        let (job_count, payload_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(CAST(payload AS BLOB))), 0) FROM jobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (media_count, media_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM media_blobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StorageUsage {
            job_count: job_count as usize,
            media_count: media_count as usize,
            payload_bytes: payload_bytes as u64,
            media_bytes: media_bytes as u64,
        })
    }

    fn storage_breakdown(&self) -> Result<Vec<StatusUsage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT j.status, COUNT(*), COALESCE(SUM(LENGTH(CAST(j.payload AS BLOB))), 0),
                      COALESCE(SUM((SELECT COUNT(*) FROM media_blobs m WHERE m.job_id = j.id)), 0),
                      COALESCE(SUM((SELECT SUM(m.size_bytes) FROM media_blobs m WHERE m.job_id = j.id)), 0)
               FROM jobs j GROUP BY j.status"#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| {
                let row = rows.iter().find(|r| r.0 == status.as_db_str());
                StatusUsage {
                    status,
                    job_count: row.map(|r| r.1 as usize).unwrap_or(0),
                    payload_bytes: row.map(|r| r.2 as u64).unwrap_or(0),
                    media_count: row.map(|r| r.3 as usize).unwrap_or(0),
                    media_bytes: row.map(|r| r.4 as u64).unwrap_or(0),
                }
            })
            .collect())
    }
}
