use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offline_sync_engine::config::{AppConfig, CliConfig, FileConfig};
use offline_sync_engine::metrics;
use offline_sync_engine::sync_queue::{
    AddJobOptions, ConnectivityMonitor, EngineSettings, ExecutionClient, ExecutionContext,
    ExecutionError, HttpExecutionClient, HttpRemoteReader, JobFilter, JobKind, JobStatus,
    MergeOptions, NewMedia, NoRemoteReader, RemoteReader, SqliteJobStore, SyncEngine,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "offline-sync", about = "Offline job queue and sync engine")]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite job queue database file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Directory where media handles are materialized.
    #[clap(long, value_parser = parse_path)]
    pub media_dir: Option<PathBuf>,

    /// Base URL of the remote execution service.
    #[clap(long)]
    pub execution_url: Option<String>,

    /// Base URL of the confirmed-records API, defaults to the execution URL.
    #[clap(long)]
    pub remote_url: Option<String>,

    /// Timeout in seconds for each remote request.
    #[clap(long)]
    pub request_timeout_secs: Option<u64>,

    /// Interval in seconds between periodic syncs, 0 disables them.
    #[clap(long)]
    pub sync_interval_secs: Option<u64>,

    /// Attempts before a retryable failure becomes terminal.
    #[clap(long)]
    pub max_attempts: Option<u32>,

    /// Local storage quota in megabytes.
    #[clap(long)]
    pub quota_mb: Option<u64>,

    /// Start with the connectivity signal offline.
    #[clap(long)]
    pub offline: bool,

    /// Identity forwarded with every submission.
    #[clap(long)]
    pub identity: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            media_dir: self.media_dir.clone(),
            execution_url: self.execution_url.clone(),
            remote_url: self.remote_url.clone(),
            request_timeout_secs: self.request_timeout_secs,
            sync_interval_secs: self.sync_interval_secs,
            max_attempts: self.max_attempts,
            quota_mb: self.quota_mb,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a job. The payload is a JSON document.
    Add {
        kind: String,
        payload: String,

        /// File to attach, may be repeated.
        #[clap(long = "media", value_parser = parse_path)]
        media: Vec<PathBuf>,

        /// Run storage cleanup if the quota would be exceeded.
        #[clap(long)]
        force_cleanup: bool,
    },

    /// List queued jobs, newest first.
    List {
        #[clap(long)]
        status: Option<String>,

        #[clap(long)]
        kind: Option<String>,

        #[clap(long)]
        limit: Option<usize>,
    },

    /// Show a job in full.
    Show { job_id: String },

    /// Show job counts by status and retry statistics.
    Stats,

    /// Dispatch every pending job now.
    Flush,

    /// Show confirmed remote records merged with local jobs.
    Merged {
        /// Include jobs that failed for good.
        #[clap(long)]
        include_failed: bool,

        #[clap(long)]
        limit: Option<usize>,
    },

    /// Remove old and excess synced or failed jobs.
    Cleanup,

    /// Show storage usage, quota and breakdown by status.
    Storage,

    /// Print the Prometheus metrics collected by this process.
    Metrics,

    /// Keep syncing in the background until interrupted.
    Run,
}

/// Execution client used when no execution service is configured.
struct UnconfiguredClient;

#[async_trait]
impl ExecutionClient for UnconfiguredClient {
    async fn submit(
        &self,
        _kind: &JobKind,
        _payload: &Value,
        _context: &ExecutionContext,
    ) -> Result<String, ExecutionError> {
        Err(ExecutionError::Transport(
            "no execution service configured".to_string(),
        ))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_media(paths: &[PathBuf]) -> Result<Vec<NewMedia>> {
    paths
        .iter()
        .map(|path| -> Result<NewMedia> {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read media file {:?}", path))?;
            Ok(NewMedia::new(data))
        })
        .collect()
}

async fn run_daemon(engine: &SyncEngine, probe: Option<Arc<HttpExecutionClient>>) -> Result<()> {
    engine.start();

    let probe_interval = Duration::from_secs(engine.settings().sync.connectivity_probe_secs.max(1));
    match &probe {
        Some(client) => info!(
            "Probing {} every {}s",
            client.base_url(),
            probe_interval.as_secs()
        ),
        None => warn!("No execution service configured, jobs stay queued"),
    }

    if engine.is_online() {
        match engine.flush().await {
            Ok(report) => info!(
                "Startup flush: {} synced, {} failed, {} skipped",
                report.processed, report.failed, report.skipped
            ),
            Err(e) => warn!("Startup flush failed: {}", e),
        }
    }

    let mut ticker = tokio::time::interval(probe_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(client) = &probe {
                    let reachable = client.health_check().await.unwrap_or(false);
                    engine.set_online(reachable);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down...");
                break;
            }
        }
    }
    Ok(())
}

async fn execute(
    command: Command,
    engine: &SyncEngine,
    http_client: Option<Arc<HttpExecutionClient>>,
) -> Result<()> {
    match command {
        Command::Add {
            kind,
            payload,
            media,
            force_cleanup,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let outcome = engine
                .add_job(
                    JobKind::parse(&kind),
                    payload,
                    read_media(&media)?,
                    AddJobOptions { force_cleanup },
                )
                .await?;
            for similar in &outcome.similar {
                warn!(
                    "Similar to {:?} {} ({:.0}% match)",
                    similar.source,
                    similar.id,
                    similar.similarity * 100.0
                );
            }
            println!("{}", outcome.job.id);
        }
        Command::List {
            status,
            kind,
            limit,
        } => {
            let mut filter = JobFilter {
                kind: kind.as_deref().map(JobKind::parse),
                limit,
                ..Default::default()
            };
            if let Some(status) = status {
                let Some(status) = JobStatus::parse(&status) else {
                    bail!("Unknown status: {}", status);
                };
                filter.statuses.push(status);
            }
            for job in engine.get_jobs(&filter)? {
                println!(
                    "{}  {:<16}  {:<16}  attempts={}  {}",
                    job.id,
                    job.status,
                    job.kind,
                    job.attempt_count,
                    job.last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default()
                );
            }
        }
        Command::Show { job_id } => match engine.get_job(&job_id)? {
            Some(job) => print_json(&job)?,
            None => bail!("Job {} not found", job_id),
        },
        Command::Stats => {
            print_json(&serde_json::json!({
                "queue": engine.stats()?,
                "retry": engine.retry_stats(),
            }))?;
        }
        Command::Flush => {
            if !engine.is_online() {
                warn!("Offline, pending jobs will be skipped");
            }
            let report = engine.flush().await?;
            print_json(report.as_ref())?;
        }
        Command::Merged {
            include_failed,
            limit,
        } => {
            let view = engine
                .merged_view(&MergeOptions {
                    include_terminal_failures: include_failed,
                    since: None,
                    limit,
                })
                .await?;
            if let Some(error) = &view.remote_error {
                warn!("Remote records unavailable: {}", error);
            }
            print_json(&view)?;
        }
        Command::Cleanup => {
            let report = engine.storage().perform_cleanup()?;
            print_json(&report)?;
        }
        Command::Storage => {
            print_json(&engine.storage().get_analytics()?)?;
        }
        Command::Metrics => {
            if let Ok(stats) = engine.stats() {
                metrics::update_queue_stats(&stats);
            }
            engine.storage().get_analytics()?;
            print!("{}", metrics::gather_metrics());
        }
        Command::Run => run_daemon(engine, http_client).await?,
    }
    Ok(())
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    match path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Ok(Some(FileConfig::load(path)?))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = load_file_config(cli_args.config.as_deref())?;
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    metrics::init_metrics();

    info!("Opening job store at {:?}...", config.db_path);
    let store = Arc::new(SqliteJobStore::new(&config.db_path)?);

    let timeout_secs = (config.sync.request_timeout_ms / 1000).max(1);
    let http_client = match &config.execution_url {
        Some(url) => {
            info!("Execution service configured at {}", url);
            Some(Arc::new(HttpExecutionClient::new(url.clone(), timeout_secs)?))
        }
        None => None,
    };
    let client: Arc<dyn ExecutionClient> = match &http_client {
        Some(client) => client.clone(),
        None => Arc::new(UnconfiguredClient),
    };
    let remote: Arc<dyn RemoteReader> = match &config.remote_url {
        Some(url) => Arc::new(HttpRemoteReader::new(url.clone(), timeout_secs)?),
        None => Arc::new(NoRemoteReader),
    };
    let connectivity = Arc::new(ConnectivityMonitor::new(
        http_client.is_some() && !cli_args.offline,
    ));

    let engine = SyncEngine::new(
        store,
        client,
        remote,
        connectivity,
        EngineSettings::from(&config),
    )?;
    if cli_args.identity.is_some() {
        engine.set_context(ExecutionContext {
            identity: cli_args.identity.clone(),
            session: None,
        });
    }

    let result = execute(cli_args.command, &engine, http_client).await;
    engine.shutdown();
    result
}
