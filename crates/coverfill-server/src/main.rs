//! Coverfill Server - Main entry point

use anyhow::Result;
use coverfill_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::{info, warn};

use coverfill_server::{
    api::{self, AppState},
    config::Config,
    covers::{
        self,
        candidates::PgCandidateSelector,
        repository::{CoverRepository, PgCoverRepository},
        sources::build_http_client,
        store::{CoverStore, S3CoverStore, UrlGuard},
        BackfillService, CoverUploadCoordinator, ProgressTracker,
    },
    db,
    storage::{config::StorageConfig, ObjectStore, Storage},
};

/// How long shutdown waits for a cancelled backfill to publish its final state
const BACKFILL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("coverfill-server")
        .filter_directives("coverfill_server=debug,tower_http=debug,sqlx=warn")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting Coverfill Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = db::create_pool(&config.database).await?;
    db::migrate(&db_pool).await?;

    let storage_config = StorageConfig::from_env()?;
    let objects: Option<Arc<dyn ObjectStore>> = if storage_config.is_configured() {
        Some(Arc::new(Storage::new(storage_config).await?))
    } else {
        warn!("S3_BUCKET is not set; cover uploads will be skipped");
        None
    };

    let covers_config = &config.covers;
    let http = build_http_client(covers_config.providers.request_timeout)?;
    let store: Arc<dyn CoverStore> = Arc::new(S3CoverStore::new(
        objects,
        covers_config.upload.store_limits(),
        UrlGuard::default(),
    )?);

    let repository: Arc<dyn CoverRepository> = Arc::new(PgCoverRepository::new(db_pool.clone()));
    let backfill = BackfillService::new(
        Arc::new(PgCandidateSelector::new(db_pool.clone())),
        covers::default_providers(&covers_config.providers, http, Arc::clone(&store)),
        Arc::clone(&repository),
        Arc::new(ProgressTracker::new()),
        covers_config.backfill.clone(),
    );
    let uploads = CoverUploadCoordinator::new(store, repository, covers_config.upload.clone());

    let state = AppState {
        db: db_pool,
        backfill: backfill.clone(),
        uploads,
    };
    let app = api::create_router(state, &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    if backfill.cancel() {
        info!("Cancelled running backfill, waiting for the worker to stop");
        if !backfill.wait_idle(BACKFILL_STOP_TIMEOUT).await {
            warn!(
                timeout_secs = BACKFILL_STOP_TIMEOUT.as_secs(),
                "Backfill worker did not stop in time"
            );
        }
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
