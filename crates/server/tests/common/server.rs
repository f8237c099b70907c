//! Server test harness.

use iotafs_catalog::{Catalog, SqliteCatalog};
use iotafs_core::ChunkerParams;
use iotafs_core::config::AppConfig;
use iotafs_server::{AppState, create_router};
use iotafs_store::{FilesystemBackend, ObjectStore};
use std::sync::Arc;
use tempfile::TempDir;

/// Chunker parameters used throughout the integration tests: small enough
/// that a few kilobytes of input split into several chunks.
pub fn test_params() -> ChunkerParams {
    ChunkerParams {
        min_chunk_size: 256,
        avg_chunk_size: 1024,
        max_chunk_size: 4096,
        normalization: 2,
    }
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server over a filesystem store and temp SQLite catalog.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        let store: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("store"))
                .await
                .expect("failed to create store backend"),
        );

        let catalog: Arc<dyn Catalog> = Arc::new(
            SqliteCatalog::new(temp_dir.path().join("catalog.db"))
                .await
                .expect("failed to open catalog"),
        );

        let mut config = AppConfig::for_testing();
        modifier(&mut config);

        let state = AppState::new(config, store, catalog, test_params());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying catalog.
    pub fn catalog(&self) -> Arc<dyn Catalog> {
        self.state.catalog.clone()
    }

    /// Get access to the underlying store.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.state.store.clone()
    }
}
