//! Local filesystem storage backend for development and tests.

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::instrument;
use uuid::Uuid;

/// Maximum range size for get_range operations (128 MiB), matching the S3
/// backend.
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key to a path under the root, rejecting traversal attempts.
    fn key_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StoreError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn map_not_found(err: std::io::Error, key: &str) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io(err)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.key_path(key)?;
        fs::try_exists(&path).await.map_err(StoreError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        if end < start {
            return Err(StoreError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end - start > MAX_RANGE_SIZE {
            return Err(StoreError::InvalidRange(format!(
                "range size {} exceeds maximum {MAX_RANGE_SIZE} bytes",
                end - start
            )));
        }

        let path = self.key_path(key)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))?;
        let len = file.metadata().await?.len();
        if end > len {
            return Err(StoreError::InvalidRange(format!(
                "range end {end} past object size {len}"
            )));
        }

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let path = self.key_path(key)?;
        Self::ensure_parent(&path).await?;

        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(e, key))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let from_path = self.key_path(from)?;
        let to_path = self.key_path(to)?;
        Self::ensure_parent(&to_path).await?;
        fs::copy(&from_path, &to_path)
            .await
            .map_err(|e| Self::map_not_found(e, from))?;
        Ok(())
    }

    /// Presigned URLs for the local backend are plain `file://` URLs; there
    /// is no authority to sign against, so expiry is ignored.
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn presign_get(&self, key: &str, _expiry: Duration) -> StoreResult<String> {
        let path = self.key_path(key)?;
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(format!("file://{}", path.display()))
    }
}
