//! File control plane handlers: dedup lookup, version registration,
//! listing, download planning, copy and delete.

use crate::error::{ApiError, ApiResult};
use crate::handlers::{decode_page_token, encode_page_token, wildcard_match};
use crate::planner;
use crate::state::{AppState, now_ms};
use axum::Json;
use axum::extract::{Path, Query, State};
use iotafs_catalog::models::FileVersionRow;
use iotafs_core::Fingerprint;
use iotafs_core::fingerprint::version_sum;
use serde::{Deserialize, Serialize};

/// Default and maximum page sizes for List/Head.
const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

/// Longest accepted file name, in bytes.
const MAX_NAME_LEN: usize = 4096;

#[derive(Debug, Deserialize)]
pub struct ChunksExistRequest {
    pub sums: Vec<Fingerprint>,
}

#[derive(Debug, Serialize)]
pub struct ChunksExistResponse {
    /// Same length as the request, positional.
    pub exists: Vec<bool>,
}

/// POST /v1/chunks/exist - positional presence bitmap. Lookup-only.
#[tracing::instrument(skip(state, req), fields(num_sums = req.sums.len()))]
pub async fn chunks_exist(
    State(state): State<AppState>,
    Json(req): Json<ChunksExistRequest>,
) -> ApiResult<Json<ChunksExistResponse>> {
    let sums: Vec<String> = req.sums.iter().map(|s| s.to_hex()).collect();
    let exists = state.catalog.chunks_exist(&sums).await?;
    Ok(Json(ChunksExistResponse { exists }))
}

#[derive(Debug, Deserialize)]
pub struct CreateFileRequest {
    pub name: String,
    /// Ordered chunk fingerprints making up the file.
    pub sums: Vec<Fingerprint>,
}

#[derive(Debug, Serialize)]
pub struct CreateFileResponse {
    /// The file version id.
    pub sum: Fingerprint,
}

/// POST /v1/files - register a named file version from uploaded chunks.
#[tracing::instrument(skip(state, req), fields(name = %req.name, num_chunks = req.sums.len()))]
pub async fn create_file(
    State(state): State<AppState>,
    Json(req): Json<CreateFileRequest>,
) -> ApiResult<Json<CreateFileResponse>> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("file name cannot be empty".to_string()));
    }
    if req.name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "file name exceeds {MAX_NAME_LEN} bytes"
        )));
    }

    let sum = version_sum(&req.name, &req.sums);
    let chunk_sums: Vec<String> = req.sums.iter().map(|s| s.to_hex()).collect();
    let outcome = state
        .catalog
        .create_file_version(
            &req.name,
            &sum.to_hex(),
            now_ms(),
            &chunk_sums,
            state.config.server.enable_versioning,
        )
        .await?;

    if outcome.created {
        tracing::info!(name = %req.name, sum = %sum, "Created file version");
    }
    Ok(Json(CreateFileResponse { sum }))
}

/// A file version as reported by List and Head.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub name: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub size: u64,
    pub sum: Fingerprint,
}

impl FileInfo {
    fn from_row(row: &FileVersionRow) -> ApiResult<Self> {
        Ok(Self {
            name: row.name.clone(),
            created_at: row.created_at,
            size: row.size as u64,
            sum: Fingerprint::from_hex(&row.sum)
                .map_err(|e| ApiError::Internal(format!("catalog sum column: {e}")))?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
    pub limit: Option<u32>,
    pub page_token: Option<String>,
    /// `*`-wildcard pattern; matching names are dropped. Wins over include.
    pub exclude: Option<String>,
    /// `*`-wildcard pattern; only matching names are returned.
    pub include: Option<String>,
    #[serde(default)]
    pub ascending: bool,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub info: Vec<FileInfo>,
    /// Token resuming after the last row scanned; filtered pages may carry
    /// fewer than `limit` entries.
    pub next_page_token: Option<String>,
}

fn matches_filters(name: &str, include: Option<&str>, exclude: Option<&str>) -> bool {
    if exclude.is_some_and(|pattern| wildcard_match(pattern, name)) {
        return false;
    }
    include.is_none_or(|pattern| wildcard_match(pattern, name))
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

/// GET /v1/files - list files by name prefix, newest version per file.
#[tracing::instrument(skip(state, query), fields(prefix = %query.prefix))]
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let limit = clamp_limit(query.limit);
    let after = match &query.page_token {
        Some(token) => Some(decode_page_token(token)?),
        None => None,
    };

    let rows = state
        .catalog
        .list_files(&query.prefix, limit, after.as_deref(), query.ascending)
        .await?;

    let next_page_token = (rows.len() as u32 == limit)
        .then(|| rows.last().map(|row| encode_page_token(&row.name)))
        .flatten();

    let info = rows
        .iter()
        .filter(|row| {
            matches_filters(&row.name, query.include.as_deref(), query.exclude.as_deref())
        })
        .map(FileInfo::from_row)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Json(ListResponse {
        info,
        next_page_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HeadQuery {
    pub name: String,
    pub limit: Option<u32>,
    pub page_token: Option<String>,
    #[serde(default)]
    pub ascending: bool,
}

/// GET /v1/versions - list the versions of one file name, newest first by
/// default.
#[tracing::instrument(skip(state, query), fields(name = %query.name))]
pub async fn head_file(
    State(state): State<AppState>,
    Query(query): Query<HeadQuery>,
) -> ApiResult<Json<ListResponse>> {
    let limit = clamp_limit(query.limit);
    let after = match &query.page_token {
        Some(token) => {
            let decoded = decode_page_token(token)?;
            Some(decoded.parse::<i64>().map_err(|e| {
                ApiError::BadRequest(format!("invalid page token: {e}"))
            })?)
        }
        None => None,
    };

    let rows = state
        .catalog
        .list_versions(&query.name, limit, after, query.ascending)
        .await?;

    let next_page_token = (rows.len() as u32 == limit)
        .then(|| {
            rows.last()
                .map(|row| encode_page_token(&row.version_id.to_string()))
        })
        .flatten();

    let info = rows
        .iter()
        .map(FileInfo::from_row)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Json(ListResponse {
        info,
        next_page_token,
    }))
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub sections: Vec<planner::Section>,
}

/// GET /v1/download/{sum} - plan the ranged reads reconstructing a version.
#[tracing::instrument(skip(state), fields(sum = %sum))]
pub async fn download(
    State(state): State<AppState>,
    Path(sum): Path<String>,
) -> ApiResult<Json<DownloadResponse>> {
    let sum = Fingerprint::from_hex(&sum)
        .map_err(|e| ApiError::BadRequest(format!("invalid file version sum: {e}")))?;

    let version = state
        .catalog
        .get_file_version(&sum.to_hex())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file version {sum}")))?;

    let contents = state.catalog.get_file_contents(version.version_id).await?;
    let planned = planner::plan_sections(&contents, planner::DEFAULT_COALESCE_GAP);
    let sections = planner::sign_sections(&state, planned).await?;

    Ok(Json(DownloadResponse { sections }))
}

#[derive(Debug, Deserialize)]
pub struct CopyRequest {
    /// Source file version sum.
    pub src: Fingerprint,
    /// Destination file name.
    pub dst: String,
}

/// POST /v1/copy - register the source version's chunks under a new name.
#[tracing::instrument(skip(state, req), fields(src = %req.src, dst = %req.dst))]
pub async fn copy_file(
    State(state): State<AppState>,
    Json(req): Json<CopyRequest>,
) -> ApiResult<Json<CreateFileResponse>> {
    if req.dst.is_empty() {
        return Err(ApiError::BadRequest("destination name cannot be empty".to_string()));
    }
    if req.dst.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "destination name exceeds {MAX_NAME_LEN} bytes"
        )));
    }

    let src = state
        .catalog
        .get_file_version(&req.src.to_hex())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file version {}", req.src)))?;
    let contents = state.catalog.get_file_contents(src.version_id).await?;

    let sums = contents
        .iter()
        .map(|row| {
            Fingerprint::from_hex(&row.chunk_sum)
                .map_err(|e| ApiError::Internal(format!("catalog sum column: {e}")))
        })
        .collect::<ApiResult<Vec<_>>>()?;
    let chunk_sums: Vec<String> = contents.iter().map(|row| row.chunk_sum.clone()).collect();

    let sum = version_sum(&req.dst, &sums);
    state
        .catalog
        .create_file_version(
            &req.dst,
            &sum.to_hex(),
            now_ms(),
            &chunk_sums,
            state.config.server.enable_versioning,
        )
        .await?;

    tracing::info!(src = %req.src, dst = %req.dst, sum = %sum, "Copied file version");
    Ok(Json(CreateFileResponse { sum }))
}

/// DELETE /v1/files/{sum} - unlink a file version. Chunks and packs survive
/// until vacuum.
#[tracing::instrument(skip(state), fields(sum = %sum))]
pub async fn delete_file(
    State(state): State<AppState>,
    Path(sum): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let sum = Fingerprint::from_hex(&sum)
        .map_err(|e| ApiError::BadRequest(format!("invalid file version sum: {e}")))?;

    state.catalog.delete_file_version(&sum.to_hex()).await?;
    tracing::info!(sum = %sum, "Deleted file version");
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub num_files: u64,
    pub num_file_versions: u64,
    /// Sum of raw sizes over all live versions.
    pub total_files_size: u64,
    /// Sum of encoded pack sizes in the store.
    pub total_data_size: u64,
}

/// GET /v1/stats - aggregate catalog statistics.
#[tracing::instrument(skip(state))]
pub async fn server_stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let stats = state.catalog.server_stats().await?;
    Ok(Json(StatsResponse {
        num_files: stats.num_files as u64,
        num_file_versions: stats.num_file_versions as u64,
        total_files_size: stats.total_files_size as u64,
        total_data_size: stats.total_data_size as u64,
    }))
}
