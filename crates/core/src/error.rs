//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid chunker params: {0}")]
    InvalidParams(String),

    #[error("chunk size {size} exceeds maximum {max}")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("packfile would exceed maximum size {max}")]
    PackTooLarge { max: u64 },

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
