//! Vacuum: reclaim space held by unreachable chunks.
//!
//! The pass marks live index entries, deletes packs with no live chunk, and
//! rewrites packs whose dead bytes exceed half their size. Rewrites copy the
//! stored block bytes verbatim into a fresh pack (no recompression), swap the
//! catalog rows in one transaction, then sweep the old object. A failure
//! leaves the old pack authoritative.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use iotafs_catalog::models::{NewIndexEntry, PackUsageRow};
use iotafs_core::packfile::{CompressionMode, PackBuilder};
use iotafs_core::Fingerprint;
use iotafs_store::StoreError;

/// Packs with more than this fraction of dead bytes are rewritten.
pub const WASTE_THRESHOLD: f64 = 0.5;

/// Counters reported by a completed vacuum pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct VacuumStats {
    pub packs_deleted: u64,
    pub packs_rewritten: u64,
    pub bytes_reclaimed: u64,
}

/// Run one full vacuum pass: mark, evaluate, rewrite, sweep.
pub async fn run(state: &AppState) -> ApiResult<VacuumStats> {
    let mut stats = VacuumStats::default();
    let usage = state.catalog.pack_usage().await?;

    for pack in &usage {
        if pack.live_chunks == 0 {
            delete_pack(state, pack, &mut stats).await?;
        } else if waste_ratio(pack) > WASTE_THRESHOLD {
            rewrite_pack(state, pack, &mut stats).await?;
        }
    }

    Ok(stats)
}

fn waste_ratio(pack: &PackUsageRow) -> f64 {
    if pack.size <= 0 {
        return 0.0;
    }
    pack.dead_bytes as f64 / pack.size as f64
}

/// Drop a wholly-unreachable pack: catalog rows first, then the object.
/// An object left behind by a crash between the two steps is swept by the
/// next run.
///
/// The catalog re-checks liveness inside the delete transaction, so a file
/// version registered after the mark phase keeps its pack.
async fn delete_pack(
    state: &AppState,
    pack: &PackUsageRow,
    stats: &mut VacuumStats,
) -> ApiResult<()> {
    if !state.catalog.delete_pack(pack.pack_id).await? {
        tracing::info!(pack_sum = %pack.sum, "Pack gained references since mark, keeping");
        return Ok(());
    }
    sweep_object(state, &pack.object_key).await;

    stats.packs_deleted += 1;
    stats.bytes_reclaimed += pack.size as u64;
    tracing::info!(pack_sum = %pack.sum, size = pack.size, "Deleted unreachable pack");
    Ok(())
}

/// Copy a pack's live blocks into a new pack and atomically swap the catalog
/// rows over to it.
async fn rewrite_pack(
    state: &AppState,
    pack: &PackUsageRow,
    stats: &mut VacuumStats,
) -> ApiResult<()> {
    let live = state.catalog.live_indexes_for_pack(pack.pack_id).await?;
    if live.is_empty() {
        return Ok(());
    }
    let pack_bytes = state.store.get(&pack.object_key).await?;

    // Live stored bytes are a strict subset of a valid pack, so they always
    // fit in a single replacement pack.
    let mut builder = PackBuilder::new(state.params.max_chunk_size);
    let mut remap = Vec::with_capacity(live.len());
    for (new_sequence, row) in live.iter().enumerate() {
        let start = row.byte_offset as usize;
        let end = start + row.stored_size as usize;
        if end > pack_bytes.len() {
            return Err(ApiError::Internal(format!(
                "index entry {} extends past pack {} ({} > {})",
                row.idx_id,
                pack.sum,
                end,
                pack_bytes.len()
            )));
        }
        let mode = CompressionMode::from_u8(row.mode as u8)?;
        let sum = Fingerprint::from_hex(&row.sum)?;
        builder.add_stored_block(sum, row.chunk_size as u64, mode, &pack_bytes[start..end])?;
        remap.push((row.idx_id, new_sequence as u32));
    }

    let (new_bytes, new_sum, new_entries) = builder.finish();
    let new_size = new_bytes.len() as u64;
    let new_key = new_sum.pack_object_key();
    state.store.put(&new_key, new_bytes).await?;

    let entries: Vec<NewIndexEntry> = new_entries
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

    let swapped = state
        .catalog
        .swap_rewritten_pack(
            pack.pack_id,
            &new_sum.to_hex(),
            new_size,
            &new_key,
            &entries,
            &remap,
        )
        .await?;
    if swapped.is_none() {
        // A version registered since the snapshot references entries the
        // new pack does not carry; the old pack stays authoritative and the
        // replacement object is discarded.
        tracing::info!(pack_sum = %pack.sum, "Pack gained references since rewrite snapshot, keeping");
        sweep_object(state, &new_key).await;
        return Ok(());
    }
    sweep_object(state, &pack.object_key).await;

    stats.packs_rewritten += 1;
    stats.bytes_reclaimed += (pack.size as u64).saturating_sub(new_size);
    tracing::info!(
        old_pack = %pack.sum,
        new_pack = %new_sum,
        old_size = pack.size,
        new_size,
        "Rewrote pack"
    );
    Ok(())
}

/// Best-effort object deletion; NotFound is the idempotent case and anything
/// else is left for the next run.
async fn sweep_object(state: &AppState, key: &str) {
    match state.store.delete(key).await {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => {
            tracing::debug!(key, "Swept object was already gone");
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "Failed to sweep object, leaving for next vacuum");
        }
    }
}
