mod file_config;

pub use file_config::{DedupConfig, FileConfig, RetryConfig, StorageConfig, SyncConfig};

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub execution_url: Option<String>,
    pub remote_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub quota_mb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub execution_url: Option<String>,
    pub remote_url: Option<String>,

    // Feature configs (with defaults)
    pub sync: SyncSettings,
    pub retry: RetrySettings,
    pub dedup: DedupSettings,
    pub storage: StorageSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                bail!("Database directory does not exist: {:?}", parent);
            }
            if !parent.is_dir() {
                bail!("Database parent is not a directory: {:?}", parent);
            }
        }

        let media_dir = file
            .media_dir
            .map(PathBuf::from)
            .or_else(|| cli.media_dir.clone())
            .unwrap_or_else(|| default_media_dir(&db_path));

        let execution_url = file
            .execution_url
            .clone()
            .or_else(|| cli.execution_url.clone());
        let remote_url = file
            .remote_url
            .clone()
            .or_else(|| cli.remote_url.clone())
            .or_else(|| execution_url.clone());

        let defaults = SyncSettings::default();
        let sync_file = file.sync.unwrap_or_default();
        let sync = SyncSettings {
            periodic_interval_secs: sync_file
                .periodic_interval_secs
                .or(cli.sync_interval_secs)
                .unwrap_or(defaults.periodic_interval_secs),
            batch_size: sync_file.batch_size.unwrap_or(defaults.batch_size).max(1),
            request_timeout_ms: sync_file
                .request_timeout_secs
                .or(cli.request_timeout_secs)
                .map(|secs| secs * 1000)
                .unwrap_or(defaults.request_timeout_ms),
            sequential_kinds: sync_file
                .sequential_kinds
                .unwrap_or(defaults.sequential_kinds),
            connectivity_probe_secs: sync_file
                .connectivity_probe_secs
                .unwrap_or(defaults.connectivity_probe_secs),
        };

        let defaults = RetrySettings::default();
        let retry_file = file.retry.unwrap_or_default();
        let retry = RetrySettings {
            max_attempts: retry_file
                .max_attempts
                .or(cli.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay_ms: retry_file.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: retry_file.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            jitter_ratio: retry_file.jitter_ratio.unwrap_or(defaults.jitter_ratio),
        };
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        let defaults = DedupSettings::default();
        let dedup_file = file.dedup.unwrap_or_default();
        let similarity_mode = match dedup_file.similarity_mode {
            Some(mode) => parse_similarity_mode(&mode)
                .ok_or_else(|| anyhow::anyhow!("Unknown similarity mode: {}", mode))?,
            None => defaults.similarity_mode,
        };
        let dedup = DedupSettings {
            window_secs: dedup_file.window_secs.unwrap_or(defaults.window_secs),
            volatile_fields: dedup_file
                .volatile_fields
                .unwrap_or(defaults.volatile_fields),
            similarity_enabled: dedup_file
                .similarity_enabled
                .unwrap_or(defaults.similarity_enabled),
            similarity_fields: dedup_file
                .similarity_fields
                .unwrap_or(defaults.similarity_fields),
            similarity_threshold: dedup_file
                .similarity_threshold
                .unwrap_or(defaults.similarity_threshold)
                .clamp(0.0, 1.0),
            similarity_mode,
            remote_check_enabled: dedup_file
                .remote_check_enabled
                .unwrap_or(defaults.remote_check_enabled),
        };

        let defaults = StorageSettings::default();
        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            quota_bytes: storage_file
                .quota_mb
                .or(cli.quota_mb)
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.quota_bytes),
            pressure_threshold: storage_file
                .pressure_threshold
                .unwrap_or(defaults.pressure_threshold),
            max_age_secs: storage_file
                .max_age_days
                .map(|days| days * 24 * 3600)
                .unwrap_or(defaults.max_age_secs),
            cleanup_interval_secs: storage_file
                .cleanup_interval_secs
                .unwrap_or(defaults.cleanup_interval_secs),
        };
        if !(storage.pressure_threshold > 0.0 && storage.pressure_threshold <= 1.0) {
            bail!(
                "storage.pressure_threshold must be in (0, 1], got {}",
                storage.pressure_threshold
            );
        }

        Ok(Self {
            db_path,
            media_dir,
            execution_url,
            remote_url,
            sync,
            retry,
            dedup,
            storage,
        })
    }
}

fn default_media_dir(db_path: &std::path::Path) -> PathBuf {
    db_path
        .parent()
        .map(|p| p.join("media-cache"))
        .unwrap_or_else(|| PathBuf::from("media-cache"))
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Seconds between periodic flushes, 0 disables the timer
    pub periodic_interval_secs: u64,
    /// Maximum number of jobs dispatched concurrently
    pub batch_size: usize,
    pub request_timeout_ms: u64,
    /// Job kinds that must run one at a time in creation order
    pub sequential_kinds: Vec<String>,
    pub connectivity_probe_secs: u64,
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 300,
            batch_size: 5,
            request_timeout_ms: 30_000,
            sequential_kinds: vec!["submit-approval".to_string()],
            connectivity_probe_secs: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            jitter_ratio: 0.2,
        }
    }
}

/// What to do when a payload is similar, but not identical, to a recent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMode {
    /// Accept the job and report the match as a warning
    Warn,
    /// Refuse the job
    Block,
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub window_secs: u64,
    /// Payload keys ignored when fingerprinting, at any depth
    pub volatile_fields: Vec<String>,
    pub similarity_enabled: bool,
    /// Payload keys compared by the fuzzy check; empty means all non-volatile keys
    pub similarity_fields: Vec<String>,
    /// Fraction of compared keys that must match, in [0, 1]
    pub similarity_threshold: f64,
    pub similarity_mode: SimilarityMode,
    pub remote_check_enabled: bool,
}

impl DedupSettings {
    pub fn window_millis(&self) -> i64 {
        (self.window_secs as i64).saturating_mul(1000)
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            window_secs: 600, // 10 minutes
            volatile_fields: ["timestamp", "created_at", "updated_at", "client_time", "nonce"]
                .into_iter()
                .map(String::from)
                .collect(),
            similarity_enabled: false,
            similarity_fields: Vec::new(),
            similarity_threshold: 0.8,
            similarity_mode: SimilarityMode::Warn,
            remote_check_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub quota_bytes: u64,
    /// Fraction of the quota above which cleanup runs regardless of age
    pub pressure_threshold: f64,
    /// Terminal jobs older than this are removed by cleanup
    pub max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            quota_bytes: 100 * 1024 * 1024,
            pressure_threshold: 0.8,
            max_age_secs: 7 * 24 * 3600,
            cleanup_interval_secs: 3600,
        }
    }
}

/// Parses a similarity mode string.
/// Uses clap's ValueEnum trait for parsing.
fn parse_similarity_mode(s: &str) -> Option<SimilarityMode> {
    SimilarityMode::from_str(s, true).ok()
}
