//! Offline job queue and sync engine
//!
//! Durable queue of deferred work that is delivered to a remote execution
//! layer once connectivity allows, with duplicate detection, retry backoff,
//! storage cleanup and a merged local/remote read view.

mod clients;
mod dedup;
mod engine;
mod event_bus;
mod http_client;
mod job_processor;
mod job_store;
mod media;
mod merge;
mod models;
mod retry_policy;
mod schema;
mod storage_manager;
mod sync_manager;

pub use clients::{
    ConnectivityMonitor, ExecutionClient, ExecutionContext, ExecutionError, NoRemoteReader,
    RemoteQuery, RemoteReader, RemoteRecord,
};
pub use dedup::{
    DeduplicationManager, DuplicateCheck, DuplicateMatch, DuplicateVerdict, MatchReason,
    MatchSource,
};
pub use engine::{AddJobError, AddJobOptions, AddJobOutcome, EngineSettings, SyncEngine};
pub use event_bus::{EventBus, JobEvent, JobEventKind, Subscription};
pub use http_client::{HttpExecutionClient, HttpRemoteReader};
pub use job_processor::{JobOutcome, JobProcessor};
pub use job_store::{JobStore, SqliteJobStore};
pub use media::{MediaHandle, MediaManager};
pub use merge::{MergeLayer, MergeOptions, MergedRecord, MergedView, MergedViewCache, RecordOrigin};
pub use models::*;
pub use retry_policy::{RetryPolicy, RetryStats};
pub use schema::JOB_QUEUE_VERSIONED_SCHEMAS;
pub use storage_manager::{
    CapacityCheck, CleanupPolicy, CleanupReport, StorageAnalytics, StorageManager, StorageQuota,
};
pub use sync_manager::{FlushError, FlushReport, SyncManager, SyncState};
