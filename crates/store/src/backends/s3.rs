//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StoreError, StoreResult};
use crate::retry::with_retry;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use bytes::Bytes;
use iotafs_core::config::StoreConfig;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use tracing::instrument;

/// Maximum range size for get_range operations (128 MiB). Packs never exceed
/// this, so a larger request is a caller bug, not a bigger allocation.
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend from the `[store]` configuration.
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let region = if config.region.is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.clone()
        };

        let credentials = aws_sdk_s3::config::Credentials::new(
            &config.access_key,
            &config.secret_key,
            None, // session token
            None, // expiration
            "iotafs-config",
        );

        let endpoint = normalize_endpoint(&config.endpoint, config.disable_ssl);

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .credentials_provider(credentials)
            .endpoint_url(endpoint);
        if config.path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    /// Convert an AWS SDK error to a StoreError. 404s map to NotFound and
    /// server-side 5xx to Transient so the retry helper can act on them.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StoreError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            let status = service_err.raw().status().as_u16();
            if status == 404 {
                return StoreError::NotFound(key.to_string());
            }
            if status >= 500 {
                return StoreError::Transient(format!("S3 returned {status} for {key}"));
            }
        }
        StoreError::S3(Box::new(err))
    }
}

/// Handle bare `host:port` endpoints by prepending a scheme chosen by the
/// `disable_ssl` flag.
fn normalize_endpoint(endpoint: &str, disable_ssl: bool) -> String {
    let lower = endpoint.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else if disable_ssl {
        format!("http://{endpoint}")
    } else {
        format!("https://{endpoint}")
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        with_retry("exists", || async {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(err) => match Self::map_sdk_error(err, key) {
                    StoreError::NotFound(_) => Ok(false),
                    other => Err(other),
                },
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        with_retry("get", || async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::Transient(format!("reading body of {key}: {e}")))?
                .into_bytes();
            Ok(bytes)
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<Bytes> {
        if end < start {
            return Err(StoreError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end == start {
            return Ok(Bytes::new());
        }
        if end - start > MAX_RANGE_SIZE {
            return Err(StoreError::InvalidRange(format!(
                "range size {} exceeds maximum {MAX_RANGE_SIZE} bytes",
                end - start
            )));
        }

        // The S3 Range header is inclusive on both ends.
        let range_header = format!("bytes={}-{}", start, end - 1);
        with_retry("get_range", || async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(&range_header)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| StoreError::Transient(format!("reading body of {key}: {e}")))?
                .into_bytes();
            Ok(bytes)
        })
        .await
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        with_retry("put", || async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(data.clone().into())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        // S3 delete_object succeeds on missing keys; head first so callers
        // get NotFound and can decide to swallow it.
        if !self.exists(key).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }

        with_retry("delete", || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, key))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        // CopySource is "bucket/key" with the key percent-encoded.
        let encoded_key = utf8_percent_encode(from, NON_ALPHANUMERIC).to_string();
        let copy_source = format!("{}/{}", self.bucket, encoded_key);

        with_retry("copy", || async {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .key(to)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, from))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_get(&self, key: &str, expiry: Duration) -> StoreResult<String> {
        let presigning = PresigningConfig::expires_in(expiry)
            .map_err(|e| StoreError::Config(format!("invalid presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StoreResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
        const MARKER_KEY: &str = ".iotafs-health-check";

        let check = async {
            self.put(MARKER_KEY, Bytes::from_static(b"health-check"))
                .await?;
            match self.delete(MARKER_KEY).await {
                Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check)
            .await
            .map_err(|_| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}
