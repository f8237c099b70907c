//! Chunker parameters and their persisted form.
//!
//! The parameters chosen on first server start are written to the blob store
//! under [`PARAMS_OBJECT_KEY`] and are authoritative for the lifetime of the
//! repository: chunk boundaries must stay stable or dedup collapses.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Object key under which the parameters blob lives in the store.
pub const PARAMS_OBJECT_KEY: &str = "params.toml";

/// Smallest permitted average chunk size (64 KiB).
pub const MIN_AVG_CHUNK_SIZE: u64 = 64 * 1024;

/// Largest permitted average chunk size (64 MiB).
pub const MAX_AVG_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default boundary-selectivity normalization level.
pub const DEFAULT_NORMALIZATION: u64 = 2;

/// Content-defined chunking parameters, fixed at repository creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub min_chunk_size: u64,
    pub avg_chunk_size: u64,
    pub max_chunk_size: u64,
    pub normalization: u64,
}

impl ChunkerParams {
    /// Derive repository parameters from an average chunk size.
    pub fn from_avg_size(avg_chunk_size: u64) -> Self {
        Self {
            min_chunk_size: avg_chunk_size / 4,
            avg_chunk_size,
            max_chunk_size: avg_chunk_size * 4,
            normalization: DEFAULT_NORMALIZATION,
        }
    }

    /// Validate the structural relationships between the parameters.
    ///
    /// The configured average is range-checked separately at config load;
    /// this check also accepts the smaller sizes used by tests.
    pub fn validate(&self) -> Result<()> {
        if self.avg_chunk_size == 0 {
            return Err(Error::InvalidParams(
                "avg_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.min_chunk_size != self.avg_chunk_size / 4 {
            return Err(Error::InvalidParams(format!(
                "min_chunk_size must be avg_chunk_size / 4, got {}",
                self.min_chunk_size
            )));
        }
        if self.max_chunk_size != self.avg_chunk_size * 4 {
            return Err(Error::InvalidParams(format!(
                "max_chunk_size must be 4 * avg_chunk_size, got {}",
                self.max_chunk_size
            )));
        }
        if !(1..=3).contains(&self.normalization) {
            return Err(Error::InvalidParams(format!(
                "normalization must be 1, 2 or 3, got {}",
                self.normalization
            )));
        }
        // mask_L needs at least one bit left after subtracting the
        // normalization level.
        let bits = 63 - self.avg_chunk_size.leading_zeros() as u64;
        if bits <= self.normalization {
            return Err(Error::InvalidParams(format!(
                "avg_chunk_size {} too small for normalization {}",
                self.avg_chunk_size, self.normalization
            )));
        }
        Ok(())
    }

    /// Boundary masks derived from the average size: `bits + n` one-bits
    /// below the average, `bits - n` at or above it, where
    /// `bits = floor(log2(avg_chunk_size))`.
    pub fn masks(&self) -> (u64, u64) {
        let bits = 63 - self.avg_chunk_size.leading_zeros() as u64;
        (
            low_bits(bits + self.normalization),
            low_bits(bits - self.normalization),
        )
    }

    /// Encode as the TOML blob stored under [`PARAMS_OBJECT_KEY`].
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode and validate the stored TOML blob.
    pub fn from_toml(s: &str) -> Result<Self> {
        let params: Self =
            toml::from_str(s).map_err(|e| Error::Serialization(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }
}

fn low_bits(n: u64) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}
