//! Engine harness backed by an on-disk store in a temporary directory.

use super::mocks::{MockExecutionClient, MockRemoteReader};
use offline_sync_engine::sync_queue::{
    AddJobError, AddJobOptions, ConnectivityMonitor, EngineSettings, Job, JobKind,
    SqliteJobStore, SyncEngine,
};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestEngine {
    pub engine: Arc<SyncEngine>,
    pub client: Arc<MockExecutionClient>,
    pub remote: Arc<MockRemoteReader>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub db_path: PathBuf,
    // Keep temp dir alive
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    pub fn online() -> Self {
        Self::with_settings(true, |_| {})
    }

    pub fn offline() -> Self {
        Self::with_settings(false, |_| {})
    }

    /// Build an engine with background timers off; `tweak` adjusts settings.
    pub fn with_settings(online: bool, tweak: impl FnOnce(&mut EngineSettings)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("queue.db");
        let mut settings = EngineSettings::new(temp_dir.path().join("media"));
        settings.sync.periodic_interval_secs = 0;
        settings.storage.cleanup_interval_secs = 0;
        tweak(&mut settings);

        let client = Arc::new(MockExecutionClient::default());
        let remote = Arc::new(MockRemoteReader::default());
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let store = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to open store"));
        let engine = SyncEngine::new(
            store,
            client.clone(),
            remote.clone(),
            connectivity.clone(),
            settings,
        )
        .expect("Failed to build engine");

        Self {
            engine: Arc::new(engine),
            client,
            remote,
            connectivity,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub async fn add(&self, payload: Value) -> Result<Job, AddJobError> {
        self.add_kind(JobKind::SubmitWork, payload).await
    }

    pub async fn add_kind(&self, kind: JobKind, payload: Value) -> Result<Job, AddJobError> {
        self.engine
            .add_job(kind, payload, vec![], AddJobOptions::default())
            .await
            .map(|outcome| outcome.job)
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
