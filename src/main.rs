//! OSS Server
//!
//! A chunked upload object storage service with resumable uploads and
//! instant-upload deduplication.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oss_server::config::Config;
use oss_server::db;
use oss_server::state::AppState;
use oss_server::storage::{LocalObjectStorage, ObjectStorage};
use oss_server::upload::{
    ChunkStore, SessionRepository, SqliteChecksumIndex, SqliteSessionJournal, UploadCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "oss_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting OSS Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.storage.root.display());

    let chunk_dir = config.storage.chunk_dir();
    let object_dir = config.storage.object_dir();
    let staging_dir = config.storage.staging_dir();
    for dir in [&chunk_dir, &object_dir, &staging_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let checksum_index = SqliteChecksumIndex::new(db_pool.clone());
    if let Err(e) = checksum_index.preload(config.upload.checksum_cache_preload).await {
        tracing::warn!("Failed to preload checksum index: {}", e);
    }

    // Reload in-flight uploads before the sweep can judge their chunks
    let sessions = SessionRepository::with_journal(Arc::new(SqliteSessionJournal::new(db_pool)));
    sessions
        .restore()
        .await
        .context("Failed to restore upload sessions")?;

    // Create upload coordinator
    let objects: Arc<dyn ObjectStorage> = Arc::new(LocalObjectStorage::new(object_dir));
    let coordinator = UploadCoordinator::new(
        sessions,
        ChunkStore::with_local_storage(chunk_dir),
        Arc::new(checksum_index),
        Arc::clone(&objects),
        config.upload_settings(),
    );

    let cleanup = coordinator
        .clone()
        .start_cleanup_task(config.upload.cleanup_interval());

    // Create application state and router
    let app_state = AppState::new(config.clone(), coordinator, objects);
    let app = oss_server::app(app_state);

    // Start server with graceful shutdown
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("OSS Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cleanup.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
