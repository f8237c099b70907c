//! The packfile binary container.
//!
//! A packfile holds many compressed chunks plus a self-describing index, all
//! integers little-endian:
//!
//! ```text
//! [ magic(4) = "IOTA" ][ version(1) ][ flags(1) ][ chunk_count(4) ]
//! [ block_0 ][ block_1 ] ...
//! [ index ]
//! [ index_offset(8) ][ pack_sum(32) ]
//! ```
//!
//! Each block is `[ size(4) ][ mode(1) ][ chunk_sum(32) ][ payload ]` and the
//! index is one fixed 61-byte record per block, in sequence order. `pack_sum`
//! covers every byte before itself.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::MAX_PACKFILE_SIZE;
use bytes::Bytes;

/// Magic bytes at the start of every packfile.
pub const PACK_MAGIC: &[u8; 4] = b"IOTA";

/// Packfile format version.
pub const PACK_VERSION: u8 = 1;

/// Size of the fixed pack header: magic + version + flags + chunk count.
pub const PACK_HEADER_SIZE: usize = 10;

/// Per-block header: stored size + mode + chunk sum.
const BLOCK_HEADER_SIZE: usize = 4 + 1 + 32;

/// One index record: sequence + chunk sum + raw size + mode + offset +
/// stored size.
pub const INDEX_RECORD_SIZE: usize = 4 + 32 + 8 + 1 + 8 + 8;

/// Pack trailer: index offset + pack sum.
pub const PACK_TRAILER_SIZE: usize = 8 + 32;

/// Per-chunk storage mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    Raw = 0,
    Zstd = 1,
}

impl CompressionMode {
    /// Parse the on-disk mode byte.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Zstd),
            other => Err(Error::Corruption(format!(
                "unknown compression mode {other}"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One block's location and identity inside a pack, as recorded in the
/// trailing index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackIndexEntry {
    pub sequence: u32,
    pub sum: Fingerprint,
    pub raw_size: u64,
    pub mode: CompressionMode,
    /// Absolute offset of the payload within the pack.
    pub offset: u64,
    pub stored_size: u64,
}

/// Accumulates chunks and encodes them as a packfile.
///
/// The builder refuses blocks that would push the encoded pack past
/// [`MAX_PACKFILE_SIZE`]; the caller finishes the current pack and starts
/// another.
pub struct PackBuilder {
    max_chunk_size: u64,
    buf: Vec<u8>,
    entries: Vec<PackIndexEntry>,
}

impl PackBuilder {
    pub fn new(max_chunk_size: u64) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(PACK_MAGIC);
        buf.push(PACK_VERSION);
        buf.push(0); // flags
        buf.extend_from_slice(&0u32.to_le_bytes()); // chunk count, backpatched
        Self {
            max_chunk_size,
            buf,
            entries: Vec::new(),
        }
    }

    /// Encoded size the pack would have if finished now.
    pub fn encoded_size(&self) -> u64 {
        (self.buf.len() + self.entries.len() * INDEX_RECORD_SIZE + PACK_TRAILER_SIZE) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunk_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Whether a block with the given stored size still fits under the
    /// packfile size cap.
    pub fn fits(&self, stored_size: usize) -> bool {
        self.encoded_size() + (BLOCK_HEADER_SIZE + stored_size + INDEX_RECORD_SIZE) as u64
            <= MAX_PACKFILE_SIZE
    }

    /// Compress and append one raw chunk.
    ///
    /// Compression is attempted once and kept only when the stored form is
    /// smaller than 95% of the raw size, otherwise the chunk is stored raw.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<Fingerprint> {
        if chunk.len() as u64 > self.max_chunk_size {
            return Err(Error::ChunkTooLarge {
                size: chunk.len() as u64,
                max: self.max_chunk_size,
            });
        }
        let sum = Fingerprint::compute(chunk);
        let compressed = zstd::bulk::compress(chunk, 0)
            .map_err(|e| Error::Serialization(format!("zstd compress: {e}")))?;
        if (compressed.len() as u64) * 100 < (chunk.len() as u64) * 95 {
            self.add_stored_block(sum, chunk.len() as u64, CompressionMode::Zstd, &compressed)?;
        } else {
            self.add_stored_block(sum, chunk.len() as u64, CompressionMode::Raw, chunk)?;
        }
        Ok(sum)
    }

    /// Append a block whose stored form was produced earlier.
    ///
    /// Vacuum rewrite re-packs stored bytes verbatim instead of
    /// recompressing them.
    pub fn add_stored_block(
        &mut self,
        sum: Fingerprint,
        raw_size: u64,
        mode: CompressionMode,
        stored: &[u8],
    ) -> Result<()> {
        if !self.fits(stored.len()) {
            return Err(Error::PackTooLarge {
                max: MAX_PACKFILE_SIZE,
            });
        }

        self.buf.extend_from_slice(&(stored.len() as u32).to_le_bytes());
        self.buf.push(mode.as_u8());
        self.buf.extend_from_slice(sum.as_bytes());
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(stored);

        self.entries.push(PackIndexEntry {
            sequence: self.entries.len() as u32,
            sum,
            raw_size,
            mode,
            offset,
            stored_size: stored.len() as u64,
        });
        Ok(())
    }

    /// Finish the pack: backpatch the chunk count, append the index and
    /// trailer, and compute the pack sum.
    pub fn finish(mut self) -> (Bytes, Fingerprint, Vec<PackIndexEntry>) {
        let count = self.entries.len() as u32;
        self.buf[6..10].copy_from_slice(&count.to_le_bytes());

        let index_offset = self.buf.len() as u64;
        for entry in &self.entries {
            self.buf.extend_from_slice(&entry.sequence.to_le_bytes());
            self.buf.extend_from_slice(entry.sum.as_bytes());
            self.buf.extend_from_slice(&entry.raw_size.to_le_bytes());
            self.buf.push(entry.mode.as_u8());
            self.buf.extend_from_slice(&entry.offset.to_le_bytes());
            self.buf.extend_from_slice(&entry.stored_size.to_le_bytes());
        }
        self.buf.extend_from_slice(&index_offset.to_le_bytes());

        let pack_sum = Fingerprint::compute(&self.buf);
        self.buf.extend_from_slice(pack_sum.as_bytes());

        (Bytes::from(self.buf), pack_sum, self.entries)
    }
}

/// Parse a fully-buffered pack: verify the container framing and the pack
/// sum, then decode the index records.
///
/// Index validation enforces strictly increasing sequences, in-bounds
/// non-overlapping payloads, and raw blocks whose stored size equals their
/// raw size.
pub fn decode_index(pack: &[u8]) -> Result<(Fingerprint, Vec<PackIndexEntry>)> {
    if pack.len() < PACK_HEADER_SIZE + PACK_TRAILER_SIZE {
        return Err(Error::Corruption("pack too small".to_string()));
    }
    if pack.len() as u64 > MAX_PACKFILE_SIZE {
        return Err(Error::PackTooLarge {
            max: MAX_PACKFILE_SIZE,
        });
    }
    if &pack[..4] != PACK_MAGIC {
        return Err(Error::Corruption("bad pack magic".to_string()));
    }
    if pack[4] != PACK_VERSION {
        return Err(Error::Corruption(format!(
            "unsupported pack version {}",
            pack[4]
        )));
    }
    let chunk_count = u32::from_le_bytes(pack[6..10].try_into().unwrap()) as usize;

    let trailer = &pack[pack.len() - PACK_TRAILER_SIZE..];
    let index_offset = u64::from_le_bytes(trailer[..8].try_into().unwrap()) as usize;
    let stored_sum = Fingerprint::from_slice(&trailer[8..40])?;

    let actual_sum = Fingerprint::compute(&pack[..pack.len() - 32]);
    if actual_sum != stored_sum {
        return Err(Error::Corruption(format!(
            "pack sum mismatch: expected {stored_sum}, got {actual_sum}"
        )));
    }

    let index_end = pack.len() - PACK_TRAILER_SIZE;
    if index_offset < PACK_HEADER_SIZE || index_offset > index_end {
        return Err(Error::Corruption("index offset out of bounds".to_string()));
    }
    let index_len = index_end - index_offset;
    if index_len != chunk_count * INDEX_RECORD_SIZE {
        return Err(Error::Corruption(format!(
            "index length {index_len} does not match chunk count {chunk_count}"
        )));
    }

    let mut entries = Vec::with_capacity(chunk_count);
    let mut prev_sequence: Option<u32> = None;
    let mut prev_end = PACK_HEADER_SIZE as u64;
    for record in pack[index_offset..index_end].chunks(INDEX_RECORD_SIZE) {
        let sequence = u32::from_le_bytes(record[..4].try_into().unwrap());
        let sum = Fingerprint::from_slice(&record[4..36])?;
        let raw_size = u64::from_le_bytes(record[36..44].try_into().unwrap());
        let mode = CompressionMode::from_u8(record[44])?;
        let offset = u64::from_le_bytes(record[45..53].try_into().unwrap());
        let stored_size = u64::from_le_bytes(record[53..61].try_into().unwrap());

        if prev_sequence.is_some_and(|prev| sequence <= prev) {
            return Err(Error::Corruption(format!(
                "duplicate or out-of-order sequence {sequence}"
            )));
        }
        prev_sequence = Some(sequence);

        // Blocks are laid out back to back; each payload is preceded by its
        // block header and must not overlap its neighbours or the index.
        if offset < prev_end + BLOCK_HEADER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "overlapping block at offset {offset}"
            )));
        }
        let end = offset
            .checked_add(stored_size)
            .ok_or_else(|| Error::Corruption("block extent overflow".to_string()))?;
        if end > index_offset as u64 {
            return Err(Error::Corruption(format!(
                "block at offset {offset} extends past the index"
            )));
        }
        prev_end = end;

        if mode == CompressionMode::Raw && stored_size != raw_size {
            return Err(Error::Corruption(format!(
                "raw block stored size {stored_size} != raw size {raw_size}"
            )));
        }

        entries.push(PackIndexEntry {
            sequence,
            sum,
            raw_size,
            mode,
            offset,
            stored_size,
        });
    }

    Ok((stored_sum, entries))
}

/// Decode a stored block payload back to raw chunk bytes, verifying the
/// recomputed fingerprint against the expected chunk sum.
pub fn decode_block(
    stored: &[u8],
    mode: CompressionMode,
    raw_size: u64,
    expected: &Fingerprint,
) -> Result<Bytes> {
    let raw = match mode {
        CompressionMode::Raw => stored.to_vec(),
        CompressionMode::Zstd => zstd::bulk::decompress(stored, raw_size as usize)
            .map_err(|e| Error::Corruption(format!("zstd decompress: {e}")))?,
    };
    if raw.len() as u64 != raw_size {
        return Err(Error::Corruption(format!(
            "decompressed size {} != raw size {raw_size}",
            raw.len()
        )));
    }
    let sum = Fingerprint::compute(&raw);
    if sum != *expected {
        return Err(Error::Corruption(format!(
            "chunk sum mismatch: expected {expected}, got {sum}"
        )));
    }
    Ok(Bytes::from(raw))
}

/// Read one chunk out of a fully-buffered pack.
pub fn read_chunk(pack: &[u8], entry: &PackIndexEntry) -> Result<Bytes> {
    let start = entry.offset as usize;
    let end = start
        .checked_add(entry.stored_size as usize)
        .filter(|&end| end <= pack.len())
        .ok_or_else(|| Error::Corruption("block extent out of bounds".to_string()))?;
    decode_block(&pack[start..end], entry.mode, entry.raw_size, &entry.sum)
}

/// Verify every block of a pack against its index: the block header must
/// match the index record and the payload must decode to bytes with the
/// recorded fingerprint.
pub fn verify_blocks(pack: &[u8], entries: &[PackIndexEntry]) -> Result<()> {
    for entry in entries {
        let header_start = entry.offset as usize - BLOCK_HEADER_SIZE;
        let header = &pack[header_start..entry.offset as usize];
        let size = u32::from_le_bytes(header[..4].try_into().unwrap()) as u64;
        let mode = CompressionMode::from_u8(header[4])?;
        let sum = Fingerprint::from_slice(&header[5..37])?;
        if size != entry.stored_size || mode != entry.mode || sum != entry.sum {
            return Err(Error::Corruption(format!(
                "block header disagrees with index at sequence {}",
                entry.sequence
            )));
        }
        read_chunk(pack, entry)?;
    }
    Ok(())
}
