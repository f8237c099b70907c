//! Database models mapping to the catalog schema.

use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// Packs and index entries
// =============================================================================

/// Registered packfile.
#[derive(Debug, Clone, FromRow)]
pub struct PackRow {
    pub pack_id: i64,
    /// Hex sum over the encoded pack bytes.
    pub sum: String,
    pub num_chunks: i64,
    /// Encoded size of the pack object in bytes.
    pub size: i64,
    pub object_key: String,
}

/// One chunk's location within a pack.
#[derive(Debug, Clone, FromRow)]
pub struct IndexRow {
    pub idx_id: i64,
    pub pack_id: i64,
    pub sequence: i64,
    /// Hex chunk fingerprint.
    pub sum: String,
    /// Raw (decompressed) chunk size.
    pub chunk_size: i64,
    /// Compression mode byte (0 = raw, 1 = zstd).
    pub mode: i64,
    /// Absolute payload offset within the pack.
    pub byte_offset: i64,
    pub stored_size: i64,
}

/// Index entry supplied at pack registration, before row ids exist.
#[derive(Debug, Clone)]
pub struct NewIndexEntry {
    pub sequence: u32,
    pub sum: String,
    pub chunk_size: u64,
    pub mode: u8,
    pub byte_offset: u64,
    pub stored_size: u64,
}

// =============================================================================
// Files and versions
// =============================================================================

/// A file version joined with its file name.
#[derive(Debug, Clone, FromRow)]
pub struct FileVersionRow {
    pub version_id: i64,
    pub file_id: i64,
    pub name: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Total raw size of the version's chunks.
    pub size: i64,
    pub num_chunks: i64,
    /// Hex version sum.
    pub sum: String,
}

/// One chunk of a file version, joined through its index entry and pack.
/// Rows are returned in dense `sequence` order 0..n-1.
#[derive(Debug, Clone, FromRow)]
pub struct ContentChunkRow {
    pub sequence: i64,
    pub idx_id: i64,
    pub chunk_sum: String,
    pub chunk_size: i64,
    pub mode: i64,
    pub byte_offset: i64,
    pub stored_size: i64,
    pub pack_id: i64,
    pub pack_sum: String,
    pub pack_object_key: String,
}

/// Outcome of registering a file version.
#[derive(Debug, Clone)]
pub struct CreateVersionOutcome {
    pub version_id: i64,
    /// False when the identical version already existed (idempotent create).
    pub created: bool,
}

// =============================================================================
// Vacuum
// =============================================================================

/// Vacuum job record.
#[derive(Debug, Clone, FromRow)]
pub struct VacuumJobRow {
    pub job_id: Uuid,
    pub status: String,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Per-pack liveness summary used by the vacuum mark phase.
#[derive(Debug, Clone, FromRow)]
pub struct PackUsageRow {
    pub pack_id: i64,
    pub sum: String,
    pub size: i64,
    pub object_key: String,
    /// Number of index entries referenced by some live file version.
    pub live_chunks: i64,
    /// Stored bytes of index entries no live version references.
    pub dead_bytes: i64,
}

// =============================================================================
// Stats
// =============================================================================

/// Aggregate catalog statistics.
#[derive(Debug, Clone, Default, FromRow)]
pub struct ServerStats {
    pub num_files: i64,
    pub num_file_versions: i64,
    /// Sum of raw sizes over all live file versions.
    pub total_files_size: i64,
    /// Sum of encoded pack sizes.
    pub total_data_size: i64,
}
