//! iotafs server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use iotafs_catalog::{Catalog, SqliteCatalog};
use iotafs_core::ChunkerParams;
use iotafs_core::config::AppConfig;
use iotafs_core::params::PARAMS_OBJECT_KEY;
use iotafs_server::{AppState, create_router};
use iotafs_store::{ObjectStore, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Timeout for loading and saving the chunker-params blob at startup.
const PARAMS_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// iotafs - a content-addressed, deduplicating file store
#[derive(Parser, Debug)]
#[command(name = "iotafs")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "IOTAFS_CONFIG", default_value = "iotafs.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("iotafs v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: TOML file plus IOTAFS_-prefixed env overrides.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("IOTAFS_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid config")?;

    // Open the catalog database.
    let db_exists = std::path::Path::new(&config.server.database).exists();
    if db_exists {
        tracing::info!(path = %config.server.database, "Using existing catalog database");
    } else {
        tracing::info!(path = %config.server.database, "Creating new catalog database");
    }
    let catalog: Arc<dyn Catalog> = Arc::new(
        SqliteCatalog::new(&config.server.database)
            .await
            .context("opening catalog database")?,
    );

    // Connect to the object store and verify it is reachable before
    // accepting requests.
    tracing::info!(endpoint = %config.store.endpoint, "Connecting to store");
    let store = iotafs_store::from_config(&config.store).context("connecting to store")?;
    store
        .health_check()
        .await
        .context("store health check failed")?;

    // Chunker parameters: read back the repository's params, or derive and
    // persist them on first start. They are authoritative once written.
    let params = ensure_chunker_params(&store, &config)
        .await
        .context("loading chunker params")?;

    // Jobs left running by a crashed process would block vacuum forever.
    let recovered = catalog
        .recover_orphaned_vacuum_jobs(iotafs_server::state::now_ms())
        .await
        .context("recovering orphaned vacuum jobs")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Marked orphaned vacuum jobs as failed");
    }

    if config.server.enable_versioning {
        tracing::info!("File versioning enabled");
    } else {
        tracing::info!("File versioning disabled");
    }

    let port = config.server.port;
    let state = AppState::new(config, store, catalog, params);
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on port {port}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Get the chunker parameters from the store, or create the blob if it does
/// not exist yet.
async fn ensure_chunker_params(
    store: &Arc<dyn ObjectStore>,
    config: &AppConfig,
) -> Result<ChunkerParams> {
    if let Some(params) = load_chunker_params(store).await? {
        tracing::info!(
            avg_chunk_size = params.avg_chunk_size,
            "Using existing chunker parameters"
        );
        return Ok(params);
    }

    let params = ChunkerParams::from_avg_size(config.server.avg_chunk_size());
    params
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("derived chunker params")?;
    save_chunker_params(store, &params).await?;
    tracing::info!(
        avg_chunk_size = params.avg_chunk_size,
        "Created chunker parameters"
    );
    Ok(params)
}

/// Read the params blob. Returns None if the object does not exist.
async fn load_chunker_params(store: &Arc<dyn ObjectStore>) -> Result<Option<ChunkerParams>> {
    let result = tokio::time::timeout(PARAMS_IO_TIMEOUT, store.get(PARAMS_OBJECT_KEY))
        .await
        .context("timed out reading chunker params")?;
    match result {
        Ok(bytes) => {
            let text = std::str::from_utf8(&bytes).context("params blob is not UTF-8")?;
            let params = ChunkerParams::from_toml(text).context("decoding params blob")?;
            Ok(Some(params))
        }
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e).context("reading chunker params"),
    }
}

/// Write the params blob to the store.
async fn save_chunker_params(
    store: &Arc<dyn ObjectStore>,
    params: &ChunkerParams,
) -> Result<()> {
    let blob = params.to_toml().context("encoding params blob")?;
    tokio::time::timeout(
        PARAMS_IO_TIMEOUT,
        store.put(PARAMS_OBJECT_KEY, blob.into_bytes().into()),
    )
    .await
    .context("timed out writing chunker params")?
    .context("writing chunker params")?;
    Ok(())
}
