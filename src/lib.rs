//! OSS Server Library
//!
//! Chunked upload object storage: files are uploaded in fixed-size chunks,
//! merged and verified against their MD5, then published under `/files`.
//! Identical content uploaded again completes instantly.
//!
//! # Modules
//!
//! - `upload`: Sessions, chunk storage, merging and the upload coordinator
//! - `storage`: Backends for published objects
//! - `db`: SQLite persistence of published objects
//! - `routes`: HTTP handlers

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let body_limit = state.config().server.max_body_bytes;

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/oss", routes::upload::router())
        .nest("/files", routes::files::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
