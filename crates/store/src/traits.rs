//! Storage trait definitions.

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Object store abstraction over an S3-compatible blob store.
///
/// Implementations are selected by configuration at startup and shared as a
/// trait object across request handlers.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Get an object's full content.
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    /// Get the bytes in `[start, end)` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<Bytes>;

    /// Put an object.
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()>;

    /// Delete an object. Fails with `NotFound` for missing keys so callers
    /// can decide whether to swallow it.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Copy an object within the bucket.
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Produce a short-lived presigned GET URL for an object.
    async fn presign_get(&self, key: &str, expiry: Duration) -> StoreResult<String>;

    /// Verify backend connectivity; called once at startup before accepting
    /// requests.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
