//! Content-defined chunking.
//!
//! Splits a byte stream at boundaries chosen by a rolling hash over a
//! sliding window, so that a local edit only moves nearby boundaries. The
//! same stream chunked twice with the same parameters produces byte-identical
//! chunk sequences, independent of how the input is buffered.

use crate::params::ChunkerParams;
use bytes::Bytes;

/// Rolling-hash window size in bytes.
///
/// With a 64-bit hash and a rotate-by-one update, a window of exactly 64
/// bytes means the departing byte's contribution has been rotated a full
/// word width by the time it leaves, so removal is a plain XOR of its table
/// value.
pub const WINDOW_SIZE: usize = 64;

const TABLE_SEED: u64 = 0x9ae1_6a3b_2f90_404f;

/// Per-byte random values for the rolling hash, fixed for the lifetime of
/// every repository. Changing the seed breaks dedup against existing packs.
const TABLE: [u64; 256] = build_table();

// splitmix64 over a fixed seed: reproducible on every platform and
// toolchain.
const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = TABLE_SEED;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

/// Streaming content-defined chunker.
///
/// One chunker per stream; it is not restartable. Feed bytes with
/// [`Chunker::feed`] and drain the final partial chunk with
/// [`Chunker::finalize`].
pub struct Chunker {
    min_size: usize,
    avg_size: usize,
    max_size: usize,
    mask_s: u64,
    mask_l: u64,
    hash: u64,
    window: [u8; WINDOW_SIZE],
    pos: usize,
    buf: Vec<u8>,
}

impl Chunker {
    /// Create a chunker for the given parameters.
    pub fn new(params: &ChunkerParams) -> Self {
        let (mask_s, mask_l) = params.masks();
        Self {
            min_size: params.min_chunk_size as usize,
            avg_size: params.avg_chunk_size as usize,
            max_size: params.max_chunk_size as usize,
            mask_s,
            mask_l,
            hash: 0,
            window: [0u8; WINDOW_SIZE],
            pos: 0,
            buf: Vec::new(),
        }
    }

    /// Feed bytes into the chunker, returning the chunks completed by this
    /// call in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        for &byte in data {
            let exiting = self.window[self.pos];
            self.window[self.pos] = byte;
            self.pos = (self.pos + 1) % WINDOW_SIZE;
            self.hash =
                self.hash.rotate_left(1) ^ TABLE[exiting as usize] ^ TABLE[byte as usize];
            self.buf.push(byte);

            let len = self.buf.len();
            if len < self.min_size {
                continue;
            }
            let split = if len >= self.max_size {
                true
            } else if len < self.avg_size {
                self.hash & self.mask_s == 0
            } else {
                self.hash & self.mask_l == 0
            };
            if split {
                out.push(self.take_chunk());
            }
        }
        out
    }

    /// Emit the final partial chunk, if any bytes remain.
    pub fn finalize(mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_chunk())
        }
    }

    fn take_chunk(&mut self) -> Bytes {
        let chunk = std::mem::take(&mut self.buf);
        // Boundaries depend only on content since the last boundary.
        self.hash = 0;
        self.window = [0u8; WINDOW_SIZE];
        self.pos = 0;
        Bytes::from(chunk)
    }
}

/// Chunk a fully-buffered byte slice.
pub fn chunk_bytes(data: &[u8], params: &ChunkerParams) -> Vec<Bytes> {
    let mut chunker = Chunker::new(params);
    let mut chunks = chunker.feed(data);
    chunks.extend(chunker.finalize());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> ChunkerParams {
        ChunkerParams {
            min_chunk_size: 256,
            avg_chunk_size: 1024,
            max_chunk_size: 4096,
            normalization: 2,
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunks_reassemble_to_input() {
        let data = test_data(100_000);
        let chunks = chunk_bytes(&data, &test_params());
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let params = test_params();
        let data = test_data(100_000);
        let chunks = chunk_bytes(&data, &params);
        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() >= params.min_chunk_size as usize);
            assert!(chunk.len() <= params.max_chunk_size as usize);
        }
        let last = chunks.last().unwrap();
        assert!(!last.is_empty());
        assert!(last.len() <= params.max_chunk_size as usize);
    }

    #[test]
    fn boundaries_independent_of_buffering() {
        let params = test_params();
        let data = test_data(50_000);

        let whole = chunk_bytes(&data, &params);

        for step in [1usize, 7, 100, 1023, 4096] {
            let mut chunker = Chunker::new(&params);
            let mut chunks = Vec::new();
            for piece in data.chunks(step) {
                chunks.extend(chunker.feed(piece));
            }
            chunks.extend(chunker.finalize());
            assert_eq!(chunks, whole, "feed step {step} changed boundaries");
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let params = test_params();
        let data = test_data(30_000);
        assert_eq!(chunk_bytes(&data, &params), chunk_bytes(&data, &params));
    }

    #[test]
    fn local_edit_leaves_distant_chunks_intact() {
        let params = test_params();
        let data = test_data(50_000);
        let mut edited = data.clone();
        for b in &mut edited[25_000..25_100] {
            *b ^= 0xff;
        }

        let before = chunk_bytes(&data, &params);
        let after = chunk_bytes(&edited, &params);

        // The head of the stream is untouched, so leading chunks match.
        assert_eq!(before.first(), after.first());
        // The edit changed at least one chunk.
        assert_ne!(before, after);
    }

    #[test]
    fn degenerate_input_splits_at_min_size() {
        // All-zero input holds the rolling hash at zero, which satisfies the
        // mask test at every position, so each chunk closes at min_size.
        let params = test_params();
        let data = vec![0u8; 20_000];
        let chunks = chunk_bytes(&data, &params);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), params.min_chunk_size as usize);
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_bytes(&[], &test_params()).is_empty());
        let chunker = Chunker::new(&test_params());
        assert!(chunker.finalize().is_none());
    }

    #[test]
    fn table_is_stable() {
        // The first table entries pin the rolling-hash constants; a change
        // here would silently break dedup across releases.
        assert_eq!(TABLE[0], {
            let mut z = TABLE_SEED.wrapping_add(0x9e37_79b9_7f4a_7c15);
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^ (z >> 31)
        });
    }
}
