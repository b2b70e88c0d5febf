//! Offline Sync Engine Library
//!
//! Exposes the queue, sync and configuration modules for the binary and for testing.

pub mod config;
pub mod metrics;
pub mod sqlite_persistence;
pub mod sync_queue;

pub use sync_queue::{SqliteJobStore, SyncEngine};
