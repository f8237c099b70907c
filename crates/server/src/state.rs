//! Application state shared across handlers.

use iotafs_catalog::Catalog;
use iotafs_core::ChunkerParams;
use iotafs_core::config::AppConfig;
use iotafs_store::ObjectStore;
use std::sync::Arc;
use time::OffsetDateTime;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object store holding packs and the params blob.
    pub store: Arc<dyn ObjectStore>,
    /// Relational catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Repository-scoped chunker parameters, authoritative once written.
    pub params: ChunkerParams,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Panics
    ///
    /// Panics if the chunker parameters are structurally invalid; they are
    /// validated wherever they are loaded, so this is a programming error.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        params: ChunkerParams,
    ) -> Self {
        if let Err(e) = params.validate() {
            panic!("invalid chunker params: {e}");
        }
        Self {
            config: Arc::new(config),
            store,
            catalog,
            params,
        }
    }
}

/// Current wall-clock time as epoch milliseconds, the catalog's timestamp
/// unit.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
