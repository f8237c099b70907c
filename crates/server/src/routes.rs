//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use iotafs_core::MAX_PACKFILE_SIZE;
use tower_http::trace::TraceLayer;

/// Slack above the packfile cap so an oversized upload reaches the handler's
/// own size check instead of being cut off mid-body.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check (unauthenticated, used by probes)
        .route("/v1/health", get(handlers::health_check))
        // Repository-scoped chunker parameters
        .route("/v1/params", get(handlers::get_chunker_params))
        // Dedup lookup
        .route("/v1/chunks/exist", post(handlers::chunks_exist))
        // Files
        .route(
            "/v1/files",
            post(handlers::create_file).get(handlers::list_files),
        )
        .route("/v1/files/{sum}", delete(handlers::delete_file))
        .route("/v1/versions", get(handlers::head_file))
        .route("/v1/download/{sum}", get(handlers::download))
        .route("/v1/copy", post(handlers::copy_file))
        .route("/v1/stats", get(handlers::server_stats))
        // Vacuum
        .route("/v1/vacuum", post(handlers::start_vacuum))
        .route("/v1/vacuum/{id}", get(handlers::vacuum_status))
        // Raw packfile upload; the method router answers 405 for anything
        // but POST.
        .route("/packfile", post(handlers::upload_packfile))
        .layer(DefaultBodyLimit::max(MAX_PACKFILE_SIZE as usize + BODY_LIMIT_SLACK))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
