//! Database schema for the job queue database.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Version 0
// =============================================================================

/// Queued jobs
const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_attempt_at", &SqlType::Integer),
        sqlite_column!("last_error_type", &SqlType::Text),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("next_retry_at", &SqlType::Integer),
        sqlite_column!("content_hash", &SqlType::Text, non_null = true),
        sqlite_column!("media_refs", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("remote_id", &SqlType::Text),
        sqlite_column!("synced_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_jobs_status_created", "status, created_at"),
        ("idx_jobs_content_hash", "content_hash"),
        ("idx_jobs_remote_id", "remote_id"),
        ("idx_jobs_next_retry", "next_retry_at"),
    ],
};

/// Binary attachments, removed together with their job
const MEDIA_BLOBS_TABLE_V0: Table = Table {
    name: "media_blobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true),
        sqlite_column!("mime_type", &SqlType::Text, non_null = true),
        sqlite_column!("size_bytes", &SqlType::Integer, non_null = true),
        sqlite_column!("data", &SqlType::Blob, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_media_job", "job_id, position")],
};

// =============================================================================
// Version 1 - insertion sequence
// =============================================================================

/// Queued jobs with a monotonic insertion sequence. `created_at` only has
/// millisecond resolution, `seq` orders jobs added within the same millisecond.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_attempt_at", &SqlType::Integer),
        sqlite_column!("last_error_type", &SqlType::Text),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("next_retry_at", &SqlType::Integer),
        sqlite_column!("content_hash", &SqlType::Text, non_null = true),
        sqlite_column!("media_refs", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("remote_id", &SqlType::Text),
        sqlite_column!("synced_at", &SqlType::Integer),
        sqlite_column!(
            "seq",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_jobs_status_created", "status, created_at"),
        ("idx_jobs_content_hash", "content_hash"),
        ("idx_jobs_remote_id", "remote_id"),
        ("idx_jobs_next_retry", "next_retry_at"),
        ("idx_jobs_seq", "seq"),
    ],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "ALTER TABLE jobs ADD COLUMN seq INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    // Existing rows keep their insertion order
    conn.execute("UPDATE jobs SET seq = rowid", [])?;
    conn.execute("CREATE INDEX idx_jobs_seq ON jobs(seq)", [])?;
    Ok(())
}

pub const JOB_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[JOBS_TABLE_V0, MEDIA_BLOBS_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1, MEDIA_BLOBS_TABLE_V0],
        migration: Some(migrate_v0_to_v1),
    },
];
