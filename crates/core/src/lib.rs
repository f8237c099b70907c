//! Core domain types and shared logic for the iotafs storage engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content fingerprints (SHA-256)
//! - The content-defined chunker and its repository-scoped parameters
//! - The packfile binary container
//! - Configuration types

pub mod chunker;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod packfile;
pub mod params;

pub use chunker::Chunker;
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use packfile::{CompressionMode, PackBuilder, PackIndexEntry};
pub use params::ChunkerParams;

/// Maximum encoded packfile size: 128 MiB.
pub const MAX_PACKFILE_SIZE: u64 = 128 * 1024 * 1024;
