//! Command-line interface.
//!
//! - `fieldsync enqueue <type> <json>` - record an action
//! - `fieldsync attach <key> <file>` - capture an attachment
//! - `fieldsync status` - show queue status and the oldest failure
//! - `fieldsync sync` - drain the queue once
//! - `fieldsync run` - keep syncing in the foreground until Ctrl-C

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::backend::{HttpBackend, RemoteBackend};
use crate::config::AppConfig;
use crate::error::SyncError;
use crate::persistence::Persistence;
use crate::queue::OfflineQueue;
use crate::sync::{start_sync_coordinator, DrainOutcome, SyncCoordinatorConfig};
use crate::types::{ActionPayload, ActionType};

#[derive(Debug, Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a config file.
    #[arg(long, short = 'c', env = "FIELDSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue database path, overriding the config file.
    #[arg(long)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record an action in the offline queue.
    Enqueue(EnqueueArgs),
    /// Capture an attachment into the local cache.
    Attach(AttachArgs),
    /// Show queue status.
    Status(StatusArgs),
    /// Drain the queue once.
    Sync,
    /// Sync in the foreground on reconnect and on a timer.
    Run,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Action type, e.g. `create-record` or `log-progress`.
    pub action_type: String,

    /// Action data as a JSON object.
    pub data: String,

    /// Key of a previously captured attachment.
    #[arg(long, short = 'a')]
    pub attachment: Option<String>,
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    /// Stable key the action will reference.
    pub key: String,

    /// File to read.
    pub file: PathBuf,

    #[arg(long, default_value = "image/jpeg")]
    pub content_type: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(path) = &self.database {
            config.storage.path = Some(path.clone());
        }
        Ok(config)
    }
}

/// Stand-in for commands that never reach the network.
struct LocalOnly;

#[async_trait]
impl RemoteBackend for LocalOnly {
    async fn insert(&self, _table: &str, _row: &Value) -> crate::error::Result<()> {
        Err(not_configured())
    }

    async fn update(&self, _table: &str, _id: &str, _patch: &Value) -> crate::error::Result<()> {
        Err(not_configured())
    }

    async fn delete(&self, _table: &str, _id: &str) -> crate::error::Result<()> {
        Err(not_configured())
    }

    async fn invoke(&self, _function: &str, _payload: &Value) -> crate::error::Result<Value> {
        Err(not_configured())
    }

    async fn upload(
        &self,
        _bucket: &str,
        _path: &str,
        _bytes: &[u8],
        _content_type: &str,
    ) -> crate::error::Result<String> {
        Err(not_configured())
    }

    async fn ping(&self) -> crate::error::Result<()> {
        Err(not_configured())
    }
}

fn not_configured() -> SyncError {
    SyncError::Internal("backend url is not configured".to_string())
}

fn open_queue(config: &AppConfig, backend: Arc<dyn RemoteBackend>) -> Result<OfflineQueue> {
    let path = config.database_path()?;
    let persistence = Persistence::new(&path)
        .with_context(|| format!("Failed to open queue database {}", path.display()))?;
    Ok(OfflineQueue::new(persistence, backend, config))
}

fn remote_backend(config: &AppConfig) -> Result<Arc<dyn RemoteBackend>> {
    let backend = HttpBackend::from_config(&config.backend)
        .context("Syncing needs a backend url. Set [backend] url or FIELDSYNC_BACKEND_URL")?;
    Ok(Arc::new(backend))
}

pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command {
        Commands::Enqueue(args) => enqueue(args, &config).await,
        Commands::Attach(args) => attach(args, &config).await,
        Commands::Status(args) => status(args, &config).await,
        Commands::Sync => sync_once(&config).await,
        Commands::Run => run(&config).await,
    }
}

async fn enqueue(args: EnqueueArgs, config: &AppConfig) -> Result<()> {
    let data: Value = serde_json::from_str(&args.data).context("Action data is not valid JSON")?;
    let mut payload = ActionPayload::new(data);
    payload.attachment = args.attachment;

    let queue = open_queue(config, Arc::new(LocalOnly))?;
    let action = queue
        .enqueue(ActionType::parse(&args.action_type), payload)
        .await?;
    println!("{}", action.id);
    Ok(())
}

async fn attach(args: AttachArgs, config: &AppConfig) -> Result<()> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let queue = open_queue(config, Arc::new(LocalOnly))?;
    let attachment = queue
        .capture_attachment(&args.key, bytes, &args.content_type)
        .await?;
    println!("{} ({} bytes)", attachment.key, attachment.bytes.len());
    Ok(())
}

async fn status(args: StatusArgs, config: &AppConfig) -> Result<()> {
    let queue = open_queue(config, Arc::new(LocalOnly))?;
    let status = queue.status().await?;
    let oldest_failure = queue.oldest_failure().await?;

    if args.json {
        let report = serde_json::json!({
            "status": status,
            "oldest_failure": oldest_failure,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Pending actions: {}", status.pending_count);
    if let Some(action) = oldest_failure {
        println!(
            "Oldest failure:  {} {} (attempts: {}, error: {})",
            action.action_type,
            action.id,
            action.retry_count,
            action.last_error.as_deref().unwrap_or("unknown")
        );
        if action.needs_recapture() {
            println!("                 attachment must be captured again");
        }
    }
    Ok(())
}

async fn sync_once(config: &AppConfig) -> Result<()> {
    let backend = remote_backend(config)?;
    let queue = open_queue(config, backend.clone())?;
    queue.set_online(backend.ping().await.is_ok());

    match queue.sync_now().await {
        DrainOutcome::Completed(report) => println!(
            "Synced {} of {} actions ({} failed, {} missing attachments, {} deferred)",
            report.succeeded,
            report.attempted,
            report.failed,
            report.missing_attachments,
            report.deferred + report.parked
        ),
        DrainOutcome::Offline => println!("Backend unreachable, nothing synced"),
        DrainOutcome::AlreadyDraining => println!("A sync is already running"),
    }
    Ok(())
}

async fn run(config: &AppConfig) -> Result<()> {
    let backend = remote_backend(config)?;
    let queue = open_queue(config, backend)?;
    let handle = start_sync_coordinator(
        queue.orchestrator(),
        queue.actions(),
        SyncCoordinatorConfig::from(&config.sync),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, stopping");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue_with_attachment() {
        let cli = Cli::parse_from([
            "fieldsync",
            "--database",
            "/tmp/queue.duckdb",
            "enqueue",
            "add-evidence",
            r#"{"task_id": "task-7"}"#,
            "--attachment",
            "photo-1",
        ]);

        assert_eq!(cli.database, Some(PathBuf::from("/tmp/queue.duckdb")));
        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.action_type, "add-evidence");
        assert_eq!(args.attachment.as_deref(), Some("photo-1"));
    }

    #[test]
    fn attach_defaults_to_jpeg() {
        let cli = Cli::parse_from(["fieldsync", "attach", "photo-1", "photo.jpg"]);
        let Commands::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        assert_eq!(args.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn local_commands_work_without_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.storage.path = Some(dir.path().join("queue.duckdb"));

        enqueue(
            EnqueueArgs {
                action_type: "create-record".to_string(),
                data: r#"{"name": "Tree-001"}"#.to_string(),
                attachment: None,
            },
            &config,
        )
        .await
        .expect("enqueue");

        let queue = open_queue(&config, Arc::new(LocalOnly)).expect("queue");
        assert_eq!(queue.status().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.storage.path = Some(dir.path().join("queue.duckdb"));

        let result = enqueue(
            EnqueueArgs {
                action_type: "create-record".to_string(),
                data: "{not json".to_string(),
                attachment: None,
            },
            &config,
        )
        .await;
        assert!(result.is_err());
    }
}
