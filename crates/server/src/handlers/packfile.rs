//! Raw packfile upload endpoint.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use iotafs_catalog::CatalogError;
use iotafs_catalog::models::NewIndexEntry;
use iotafs_core::packfile::{PackIndexEntry, decode_index, verify_blocks};
use iotafs_core::Fingerprint;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct UploadPackResponse {
    /// Sum of the registered pack.
    pub sum: Fingerprint,
}

/// POST /packfile - upload a fully-formed packfile.
///
/// The body is verified end-to-end (pack sum, per-block sums, sequence and
/// overlap rules) before anything is written. The object lands under a
/// temporary key, is renamed to its content-addressed key, and the catalog
/// rows commit in one transaction; any failure removes the temporary object
/// and commits nothing.
#[tracing::instrument(skip(state, body), fields(size = body.len()))]
pub async fn upload_packfile(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<UploadPackResponse>> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty request body".to_string()));
    }

    let (pack_sum, entries) = decode_index(&body)?;
    if entries.is_empty() {
        return Err(ApiError::BadRequest(
            "packfile contains no chunks".to_string(),
        ));
    }
    for entry in &entries {
        if entry.raw_size > state.params.max_chunk_size {
            return Err(ApiError::BadRequest(format!(
                "chunk {} exceeds max chunk size {}",
                entry.sum, state.params.max_chunk_size
            )));
        }
    }
    verify_blocks(&body, &entries)?;

    // Re-uploading a known pack is a no-op: identical sum means identical
    // bytes under content addressing.
    if state
        .catalog
        .get_pack_by_sum(&pack_sum.to_hex())
        .await?
        .is_some()
    {
        tracing::debug!(sum = %pack_sum, "Pack already registered");
        return Ok(Json(UploadPackResponse { sum: pack_sum }));
    }

    let size = body.len() as u64;
    let temp_key = format!("tmp/{}", Uuid::new_v4());
    let final_key = pack_sum.pack_object_key();

    state.store.put(&temp_key, body).await?;

    match register_pack(&state, &pack_sum, size, &temp_key, &final_key, &entries).await {
        Ok(()) => {
            // The temporary object is redundant once the final key exists.
            if let Err(e) = state.store.delete(&temp_key).await {
                tracing::warn!(key = %temp_key, error = %e, "Failed to remove temporary pack object");
            }
            tracing::info!(sum = %pack_sum, size, num_chunks = entries.len(), "Registered pack");
            Ok(Json(UploadPackResponse { sum: pack_sum }))
        }
        Err(err) => {
            if let Err(e) = state.store.delete(&temp_key).await {
                tracing::warn!(key = %temp_key, error = %e, "Failed to remove temporary pack object");
            }
            Err(err)
        }
    }
}

/// Rename the verified upload to its final key and commit the catalog rows.
/// On a catalog failure the final object is removed as well, so a failed
/// upload leaves no trace.
async fn register_pack(
    state: &AppState,
    pack_sum: &Fingerprint,
    size: u64,
    temp_key: &str,
    final_key: &str,
    entries: &[PackIndexEntry],
) -> ApiResult<()> {
    state.store.copy(temp_key, final_key).await?;

    let new_entries: Vec<NewIndexEntry> = entries
        .iter()
        .map(|e| NewIndexEntry {
            sequence: e.sequence,
            sum: e.sum.to_hex(),
            chunk_size: e.raw_size,
            mode: e.mode.as_u8(),
            byte_offset: e.offset,
            stored_size: e.stored_size,
        })
        .collect();

    match state
        .catalog
        .register_pack(&pack_sum.to_hex(), size, final_key, &new_entries)
        .await
    {
        Ok(_) => Ok(()),
        // A concurrent upload of the same pack won the registration race;
        // the object bytes are identical, so this upload succeeded too.
        Err(CatalogError::Constraint(_)) => {
            tracing::debug!(sum = %pack_sum, "Pack registered concurrently");
            Ok(())
        }
        Err(err) => {
            if let Err(e) = state.store.delete(final_key).await {
                tracing::warn!(key = %final_key, error = %e, "Failed to remove pack object after catalog failure");
            }
            Err(err.into())
        }
    }
}
