//! Imaging Gateway Relay - Main Entry Point
//!
//! `gateway run` hosts the pipeline supervisor and its five stages until
//! Ctrl+C or until the pipeline stops itself. `gateway ingest` hands one
//! received association folder to a running relay through the shared queue
//! database.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::FileConfigProvider;
use gateway_core::application::stages::{build_pipeline, PipelineDeps, QueuePaths};
use gateway_core::application::supervisor::{InferenceClientFactory, PipelineSupervisor};
use gateway_core::application::{IngestRequest, IngestService};
use gateway_core::domain::{GatewayConfig, InferenceConfig};
use gateway_core::error::AppError;
use gateway_core::port::id_provider::UuidProvider;
use gateway_core::port::time_provider::SystemTimeProvider;
use gateway_core::port::{ConfigProvider, InferenceClient, QueueStore, SharedInferenceClient, TimeProvider};
use gateway_infra_http::HttpInferenceClient;
use gateway_infra_sqlite::SqliteQueueStore;
use gateway_infra_system::{DirectoryResultSender, FsArtifactStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Imaging gateway relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default)
    Run,

    /// Submit a received association folder to the relay
    Ingest {
        /// Folder holding the received files
        folder: PathBuf,

        /// AE title of the sending modality
        #[arg(long)]
        calling_ae: String,

        /// AE title the modality addressed (selects the model route)
        #[arg(long)]
        called_ae: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = logging::init_logging()?;

    let provider = Arc::new(FileConfigProvider::from_env());
    let config = provider
        .load()
        .await
        .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(provider, config).await,
        Commands::Ingest {
            folder,
            calling_ae,
            called_ae,
        } => ingest(&config, folder, calling_ae, called_ae).await,
    }
}

/// SQLite URL for the configured queue database, creating its folder
fn queue_database_url(config: &GatewayConfig) -> Result<String> {
    let path = &config.storage.queue_db_path;
    if path.starts_with("sqlite:") {
        return Ok(path.clone());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(format!("sqlite://{}", path))
}

fn http_client_factory() -> InferenceClientFactory {
    Arc::new(|config: &InferenceConfig| -> gateway_core::Result<Arc<dyn InferenceClient>> {
        let client = HttpInferenceClient::new(config).map_err(AppError::from)?;
        Ok(Arc::new(client) as Arc<dyn InferenceClient>)
    })
}

async fn run(provider: Arc<FileConfigProvider>, config: GatewayConfig) -> Result<()> {
    info!("Imaging gateway v{} starting...", VERSION);
    if let Some(path) = provider.path() {
        info!(config = %path.display(), "Configuration loaded");
    } else {
        warn!("GATEWAY_CONFIG not set, running on defaults and environment overrides");
    }

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);

    // 1. Queue store (releases leases left by a previous run)
    let database_url = queue_database_url(&config)?;
    info!(database = %database_url, "Opening queue store...");
    let store: Arc<dyn QueueStore> = Arc::new(
        SqliteQueueStore::connect(&database_url, Arc::clone(&time_provider))
            .await
            .context("Queue store initialization failed")?,
    );

    // 2. Pipeline (DI wiring)
    let inference = SharedInferenceClient::unconfigured();
    let deps = PipelineDeps {
        queue_store: Arc::clone(&store),
        artifacts: Arc::new(FsArtifactStore::new()),
        inference: inference.clone(),
        sender: Arc::new(DirectoryResultSender::new()),
        time_provider: Arc::clone(&time_provider),
    };
    let stages = build_pipeline(&config, &QueuePaths::default(), &deps);

    let supervisor = PipelineSupervisor::new(
        stages,
        provider,
        inference,
        http_client_factory(),
        Arc::clone(&time_provider),
    )
    .into_runtime(Arc::clone(&store));
    let mut stop_requested = supervisor.stop_requested();

    // 3. Start
    supervisor
        .start()
        .await
        .context("Pipeline failed to start")?;

    info!("System ready. Press Ctrl+C to shutdown");

    // 4. Wait for Ctrl+C or a pipeline-initiated stop
    let mut exit_error = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received. Exiting gracefully..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
        _ = stop_requested.wait() => {
            error!("Pipeline requested stop");
            exit_error = Some(anyhow::anyhow!("pipeline stopped itself; see log for the cause"));
        }
    }

    // 5. Graceful shutdown (bounded per stage)
    supervisor.stop().await;
    info!("Shutdown complete.");

    match exit_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn ingest(
    config: &GatewayConfig,
    folder: PathBuf,
    calling_ae: String,
    called_ae: String,
) -> Result<()> {
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let database_url = queue_database_url(config)?;

    // Attach without lease recovery: the running relay owns the open leases
    let store = SqliteQueueStore::attach(&database_url, Arc::clone(&time_provider))
        .await
        .context("Queue store initialization failed")?;
    let paths = QueuePaths::default();
    let service = IngestService::new(
        Arc::new(store),
        Arc::new(UuidProvider),
        time_provider,
        paths.receive,
    );

    let folder = std::fs::canonicalize(&folder)
        .with_context(|| format!("Association folder {} not found", folder.display()))?;
    let correlation_id = service
        .submit(IngestRequest {
            association_folder: folder,
            calling_ae,
            called_ae,
        })
        .await?;

    println!("{}", correlation_id);
    Ok(())
}
