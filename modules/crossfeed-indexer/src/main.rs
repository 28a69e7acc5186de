use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crossfeed_common::config::load_config;
use crossfeed_common::{AppConfig, FileConfig, SourceId, UserId};
use crossfeed_indexer::{ApplyEngine, HttpSourceClient, Poller, SoftDeletePolicy, SourceRegistry};
use crossfeed_store::{
    CursorStore, MemoryCursorStore, MemoryRecordIndex, PgCursorStore, PgRecordIndex, RecordIndex,
};

#[derive(Parser)]
#[command(name = "crossfeed", about = "Cross-source event indexer")]
struct Cli {
    /// Path to config TOML file
    #[arg(long, default_value = "./config/crossfeed.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every configured source until Ctrl-C
    Run,
    /// Run a single poll cycle and exit
    Once,
    /// Clear one user's cursor so their history is replayed
    Reset {
        #[arg(long)]
        source: String,
        #[arg(long)]
        user: String,
    },
    /// Drop every cursor held for a source. Sources come from the config
    /// file, so one still listed there is polled again from scratch on the
    /// next run; remove it from the file to stop polling it.
    Deregister {
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.canonicalize().with_context(|| {
        format!(
            "Config file not found: {}. Create one or specify --config <path>",
            cli.config.display()
        )
    })?;
    tracing::info!(config = %config_path.display(), "Loading config");
    let file_config = load_config(&config_path)?;

    let app_config = AppConfig::from_env();
    let (cursors, index) = open_stores(&app_config).await?;

    let poller = build_poller(&file_config, cursors, index)?;

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, shutting down");
                }
                let _ = shutdown_tx.send(true);
            });
            poller.run(shutdown_rx).await;
        }
        Command::Once => {
            let stats = poller.run_cycle().await;
            tracing::info!(%stats, "Poll cycle complete");
        }
        Command::Reset { source, user } => {
            poller
                .reset(&SourceId::new(source), &UserId::new(user))
                .await?;
        }
        Command::Deregister { source } => {
            let source = SourceId::new(source);
            if poller.deregister(&source).await?.is_some() {
                tracing::warn!(
                    source = %source,
                    "Cursors dropped; the source is still in the config and will be replayed on the next run"
                );
            } else {
                tracing::warn!(source = %source, "Source not in config, cursors dropped anyway");
            }
        }
    }

    Ok(())
}

async fn open_stores(
    config: &AppConfig,
) -> Result<(Arc<dyn CursorStore>, Arc<dyn RecordIndex>)> {
    let Some(url) = &config.database_url else {
        tracing::warn!("No DATABASE_URL, cursors and records will not survive a restart");
        return Ok((
            Arc::new(MemoryCursorStore::new()),
            Arc::new(MemoryRecordIndex::new()),
        ));
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(url)
        .await
        .context("Failed to connect to Postgres")?;
    crossfeed_store::migrate(&pool).await?;
    tracing::info!("Migrations complete");

    Ok((
        Arc::new(PgCursorStore::new(pool.clone())),
        Arc::new(PgRecordIndex::new(pool)),
    ))
}

fn build_poller(
    config: &FileConfig,
    cursors: Arc<dyn CursorStore>,
    index: Arc<dyn RecordIndex>,
) -> Result<Poller> {
    let registry = Arc::new(SourceRegistry::from_config(&config.sources)?);
    let client = Arc::new(HttpSourceClient::new(config.indexer.request_timeout())?);
    let engine = ApplyEngine::new(index, SoftDeletePolicy::from_config(&config.soft_delete));

    Ok(Poller::new(
        client,
        cursors,
        engine,
        registry,
        &config.indexer,
    ))
}
