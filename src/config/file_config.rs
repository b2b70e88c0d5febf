use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub media_dir: Option<String>,
    pub execution_url: Option<String>,
    pub remote_url: Option<String>,

    // Feature configs
    pub sync: Option<SyncConfig>,
    pub retry: Option<RetryConfig>,
    pub dedup: Option<DedupConfig>,
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub periodic_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub sequential_kinds: Option<Vec<String>>,
    pub connectivity_probe_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ratio: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: Option<u64>,
    pub volatile_fields: Option<Vec<String>>,
    pub similarity_enabled: Option<bool>,
    pub similarity_fields: Option<Vec<String>>,
    pub similarity_threshold: Option<f64>,
    /// "warn" or "block"
    pub similarity_mode: Option<String>,
    pub remote_check_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub quota_mb: Option<u64>,
    pub pressure_threshold: Option<f64>,
    pub max_age_days: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
