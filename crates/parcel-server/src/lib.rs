//! Parcel upload server: accepts chunked, integrity-checked uploads over
//! HTTP and keeps the finished artifacts on disk until they expire.

pub mod assembler;
pub mod config;
pub mod health;
pub mod reaper;
pub mod registry;
pub mod routes;
pub mod session;
pub mod storage;
pub mod store;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, Method, header::CONTENT_TYPE},
    middleware,
    routing::{delete, get, post},
};
use parcel_types::headers;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::assembler::ChunkAssembler;
use crate::config::ServerConfig;
use crate::health::HealthMonitor;
use crate::registry::SessionRegistry;
use crate::routes::AppState;
use crate::storage::BlobStore;
use crate::store::SessionStore;

/// Wires the session store and blob store into shared state.
pub fn build_state(
    config: Arc<ServerConfig>,
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
) -> AppState {
    let registry = Arc::new(SessionRegistry::new(sessions, config));
    AppState {
        assembler: Arc::new(ChunkAssembler::new(registry, blobs)),
        health: Arc::new(HealthMonitor::new()),
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.assembler.registry().config().max_chunk_size as usize + 64 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(
            [
                headers::SESSION_ID,
                headers::UPLOAD_ID,
                headers::CHUNK_INDEX,
                headers::TOTAL_CHUNKS,
                headers::CHUNK_HASH,
                headers::HASH_ALGORITHM,
            ]
            .map(HeaderName::from_static)
            .into_iter()
            .chain([CONTENT_TYPE])
            .collect::<Vec<_>>(),
        )
        .allow_credentials(false);

    Router::new()
        .route("/api/upload/init", post(routes::init_upload))
        .route("/api/upload/chunk", post(routes::upload_chunk))
        .route("/api/upload/finalize", post(routes::finalize_upload))
        .route("/api/upload/{id}", delete(routes::cleanup_upload))
        .route("/api/upload/{id}/status", get(routes::upload_status))
        .route("/api/download/{id}", get(routes::download_blob))
        .route(health::HEALTH_PATH, get(routes::health))
        .layer(middleware::from_fn_with_state(state.health.clone(), health::track))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
