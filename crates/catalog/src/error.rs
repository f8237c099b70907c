//! Catalog error types.

use thiserror::Error;

/// Format missing chunks for display, capping at MAX_DISPLAYED to prevent
/// log/response bloat.
fn format_missing_chunks(chunks: &[String]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if chunks.len() <= MAX_DISPLAYED {
        format!("{:?}", chunks)
    } else {
        let sample: Vec<_> = chunks.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, chunks.len() - MAX_DISPLAYED)
    }
}

/// Catalog operation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("missing {} chunks: {}", .missing_chunks.len(), format_missing_chunks(.missing_chunks))]
    MissingChunks { missing_chunks: Vec<String> },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
