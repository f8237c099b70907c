//! Object store abstraction and backends for iotafs.
//!
//! Packs and the chunker-params blob live in an S3-compatible object store.
//! All object names are content-addressed, so overwriting an object with
//! different bytes never happens; only per-object read-after-write
//! consistency is assumed.

pub mod backends;
pub mod error;
pub mod retry;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StoreError, StoreResult};
pub use retry::with_retry;
pub use traits::ObjectStore;

use iotafs_core::config::StoreConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub fn from_config(config: &StoreConfig) -> StoreResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StoreError::Config)?;
    let backend = S3Backend::new(config)?;
    Ok(Arc::new(backend))
}
