//! Download planner.
//!
//! Turns a file version's ordered chunk list into the minimal set of ranged
//! packfile reads: consecutive chunks sharing a pack are grouped, and
//! near-adjacent chunks are coalesced into one range when the gap between
//! them is small enough that over-reading beats a second request.

use crate::error::ApiResult;
use crate::state::AppState;
use iotafs_catalog::models::ContentChunkRow;
use iotafs_core::Fingerprint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gaps smaller than this are absorbed into the surrounding range.
pub const DEFAULT_COALESCE_GAP: u64 = 64 * 1024;

/// Lifetime of the presigned section URLs handed to clients.
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// One chunk within a section's fetched range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionChunk {
    /// Logical position of the chunk within the file.
    pub sequence: u64,
    /// Raw (decompressed) chunk size.
    pub size: u64,
    /// Chunk fingerprint, verified by the client after decompression.
    pub sum: Fingerprint,
    /// Byte offset of the stored block within the fetched range.
    pub offset: u64,
    /// Stored (possibly compressed) size of the block.
    pub stored_size: u64,
    /// Compression mode byte (0 = raw, 1 = zstd).
    pub mode: u8,
}

/// One ranged read against one pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub pack_sum: Fingerprint,
    /// Presigned GET URL for the pack object.
    pub url: String,
    /// Byte range `[range_start, range_end)` to request.
    pub range_start: u64,
    pub range_end: u64,
    /// Chunks to slice out of the range, in logical file order.
    pub chunks: Vec<SectionChunk>,
}

/// A section before its URL is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSection {
    pub pack_id: i64,
    pub pack_sum: String,
    pub pack_object_key: String,
    pub range_start: u64,
    pub range_end: u64,
    pub chunks: Vec<PlannedChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub sequence: u64,
    pub size: u64,
    pub sum: String,
    /// Absolute payload offset within the pack; rebased onto the range when
    /// the section is rendered.
    pub pack_offset: u64,
    pub stored_size: u64,
    pub mode: u8,
}

/// Group a version's contents into ranged reads.
///
/// Rows must arrive in dense sequence order; the output sections preserve
/// that order because reconstruction concatenates per-section chunks as
/// listed.
pub fn plan_sections(contents: &[ContentChunkRow], coalesce_gap: u64) -> Vec<PlannedSection> {
    let mut sections: Vec<PlannedSection> = Vec::new();

    for row in contents {
        let offset = row.byte_offset as u64;
        let stored_size = row.stored_size as u64;
        let chunk = PlannedChunk {
            sequence: row.sequence as u64,
            size: row.chunk_size as u64,
            sum: row.chunk_sum.clone(),
            pack_offset: offset,
            stored_size,
            mode: row.mode as u8,
        };

        let extend = sections.last().is_some_and(|section| {
            section.pack_id == row.pack_id
                && range_gap(section.range_start, section.range_end, offset, stored_size)
                    < coalesce_gap
        });

        if extend {
            let section = sections.last_mut().unwrap();
            section.range_start = section.range_start.min(offset);
            section.range_end = section.range_end.max(offset + stored_size);
            section.chunks.push(chunk);
        } else {
            sections.push(PlannedSection {
                pack_id: row.pack_id,
                pack_sum: row.pack_sum.clone(),
                pack_object_key: row.pack_object_key.clone(),
                range_start: offset,
                range_end: offset + stored_size,
                chunks: vec![chunk],
            });
        }
    }

    sections
}

/// Distance between an existing range and a candidate block; zero when they
/// touch or overlap.
fn range_gap(range_start: u64, range_end: u64, offset: u64, stored_size: u64) -> u64 {
    if offset >= range_end {
        offset - range_end
    } else if offset + stored_size <= range_start {
        range_start - (offset + stored_size)
    } else {
        0
    }
}

/// Render planned sections into client-facing sections with presigned URLs
/// and range-relative offsets.
pub async fn sign_sections(
    state: &AppState,
    planned: Vec<PlannedSection>,
) -> ApiResult<Vec<Section>> {
    let mut sections = Vec::with_capacity(planned.len());
    for section in planned {
        let url = state
            .store
            .presign_get(&section.pack_object_key, PRESIGN_EXPIRY)
            .await?;
        let range_start = section.range_start;
        let chunks = section
            .chunks
            .into_iter()
            .map(|chunk| {
                Ok(SectionChunk {
                    sequence: chunk.sequence,
                    size: chunk.size,
                    sum: Fingerprint::from_hex(&chunk.sum)?,
                    offset: chunk.pack_offset - range_start,
                    stored_size: chunk.stored_size,
                    mode: chunk.mode,
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;
        sections.push(Section {
            pack_sum: Fingerprint::from_hex(&section.pack_sum)?,
            url,
            range_start,
            range_end: section.range_end,
            chunks,
        });
    }
    Ok(sections)
}
