use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use warden::api::{self, ApiState};
use warden::catalog::StaticCatalog;
use warden::config::WardenConfig;
use warden::persistence::{HttpResourceIndex, PostgresStore, PostgresWorkQueue};
use warden::runtime::WardenRuntimeBuilder;
use warden::settings::HttpMetadataSource;

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Scheduler for discovery, compliance and query jobs")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the scheduler loops and the HTTP API
    Serve {
        /// Catalog snapshot; overrides WARDEN_CATALOG_PATH
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    warden::telemetry::init_tracing("info,warden=debug");

    let args = Args::parse();
    let mut config = WardenConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.persistence.max_connections)
        .min_connections(config.persistence.min_connections)
        .acquire_timeout(Duration::from_secs(
            config.persistence.acquire_timeout_seconds,
        ))
        .connect(&config.persistence.connection_string)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;

    let catalog_override = match args.command {
        Command::Migrate => {
            info!("migrations applied");
            return Ok(());
        }
        Command::Serve { catalog } => catalog,
    };
    if catalog_override.is_some() {
        config.catalog_path = catalog_override;
    }

    #[cfg(feature = "metrics")]
    warden::metrics::init_metrics()?;

    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => StaticCatalog::load(path)?,
        None => {
            warn!("no catalog configured; scheduled triggers have nothing to do");
            StaticCatalog::default()
        }
    });

    let mut builder = WardenRuntimeBuilder::new(config.clone())
        .with_store(Arc::new(PostgresStore::new(pool.clone())))
        .with_workflows(Arc::new(PostgresStore::new(pool.clone())))
        .with_queue(Arc::new(
            PostgresWorkQueue::new(pool)
                .with_redelivery(config.consumer.redelivery.clone()),
        ))
        .with_integrations(catalog.clone())
        .with_catalog(catalog);
    if let Some(index) = &config.index {
        builder = builder.with_index(Arc::new(HttpResourceIndex::new(index.clone())?));
    }
    if let Some(url) = &config.metadata_url {
        builder = builder.with_metadata_source(Box::new(HttpMetadataSource::new(url.clone())?));
    }

    let runtime = builder.build()?;
    runtime.start().await?;

    let app = api::router(ApiState::new(
        runtime.scheduler().clone(),
        runtime.describe_service().clone(),
    ));
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    info!(addr = %config.http_addr, "warden listening");

    let shutdown = runtime.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    runtime.shutdown().await
}
