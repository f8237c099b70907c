//! Request handlers.

pub mod files;
pub mod packfile;
pub mod vacuum;

pub use files::{
    chunks_exist, copy_file, create_file, delete_file, download, head_file, list_files,
    server_stats,
};
pub use packfile::upload_packfile;
pub use vacuum::{start_vacuum, vacuum_status};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use iotafs_core::ChunkerParams;
use serde_json::{Value, json};

/// GET /v1/health - liveness and catalog connectivity.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.catalog.health_check().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// GET /v1/params - the repository-scoped chunker parameters.
#[tracing::instrument(skip(state))]
pub async fn get_chunker_params(State(state): State<AppState>) -> Json<ChunkerParams> {
    Json(state.params)
}

/// Opaque pagination token: base64 over the last-seen sort key.
pub(crate) fn encode_page_token(key: &str) -> String {
    BASE64.encode(key)
}

pub(crate) fn decode_page_token(token: &str) -> ApiResult<String> {
    let bytes = BASE64
        .decode(token)
        .map_err(|e| ApiError::BadRequest(format!("invalid page token: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid page token: {e}")))
}

/// Match `pattern` against `name`, where `*` matches any run of characters
/// (including none). Used by the List include/exclude filters.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star_p, star_n)) = star {
            // Backtrack: let the last star absorb one more character.
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
