//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 6776;

/// Default catalog database path.
pub const DEFAULT_DATABASE: &str = "./iotafs.db";

/// Default object store endpoint.
pub const DEFAULT_STORE_ENDPOINT: &str = "s3.amazonaws.com";

/// Valid range for the configured average chunk size, in KiB.
pub const MIN_AVG_CHUNK_KIB: u64 = 64;
pub const MAX_AVG_CHUNK_KIB: u64 = 64 * 1024;

/// Default average chunk size: 1 MiB.
pub const DEFAULT_AVG_CHUNK_KIB: u64 = 1024;

/// Server configuration (`[server]` section).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the catalog database file.
    #[serde(default = "default_database")]
    pub database: String,
    /// Keep prior versions of a file when a new one is created.
    #[serde(default)]
    pub enable_versioning: bool,
    /// Average chunk size in KiB, used to derive the chunker parameters on
    /// first start. Ignored once `params.toml` exists in the store.
    #[serde(default = "default_avg_chunk_kib")]
    pub avg_chunk_kib: u64,
}

/// Object store configuration (`[store]` section).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub disable_ssl: bool,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_avg_chunk_kib() -> u64 {
    DEFAULT_AVG_CHUNK_KIB
}

fn default_endpoint() -> String {
    DEFAULT_STORE_ENDPOINT.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database: default_database(),
            enable_versioning: false,
            avg_chunk_kib: default_avg_chunk_kib(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.database.is_empty() {
            return Err("field \"database\" is required".to_string());
        }
        if self.avg_chunk_kib < MIN_AVG_CHUNK_KIB || self.avg_chunk_kib > MAX_AVG_CHUNK_KIB {
            return Err(format!(
                "avg_chunk_kib must be in range {MIN_AVG_CHUNK_KIB} to {MAX_AVG_CHUNK_KIB}"
            ));
        }
        Ok(())
    }

    /// Average chunk size in bytes.
    pub fn avg_chunk_size(&self) -> u64 {
        self.avg_chunk_kib * 1024
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.access_key.is_empty() {
            return Err("field \"access_key\" is required".to_string());
        }
        if self.secret_key.is_empty() {
            return Err("field \"secret_key\" is required".to_string());
        }
        if self.bucket.is_empty() {
            return Err("field \"bucket\" is required".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.server
            .validate()
            .map_err(|e| format!("[server]: {e}"))?;
        self.store.validate().map_err(|e| format!("[store]: {e}"))?;
        Ok(())
    }

    /// Create a test configuration with dummy store credentials.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig {
                access_key: "test-access".to_string(),
                secret_key: "test-secret".to_string(),
                bucket: "test-bucket".to_string(),
                region: String::new(),
                disable_ssl: true,
                path_style: true,
                endpoint: "localhost:9000".to_string(),
            },
        }
    }
}
