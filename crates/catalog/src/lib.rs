//! Relational catalog for the iotafs storage engine.
//!
//! This crate provides the control-plane data model:
//! - Packs and their per-chunk index entries
//! - Files, file versions, and the ordered version → chunk mapping
//! - Vacuum job state
//!
//! The catalog is single-writer: one SQLite database with a process-wide
//! write mutex serializing transactions while readers query concurrently.

pub mod error;
pub mod models;
pub mod sqlite;

pub use error::{CatalogError, CatalogResult};
pub use sqlite::{Catalog, SqliteCatalog};
