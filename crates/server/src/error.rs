//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] iotafs_store::StoreError),

    #[error("catalog error: {0}")]
    Catalog(#[from] iotafs_catalog::CatalogError),

    #[error("core error: {0}")]
    Core(#[from] iotafs_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Store(e) => match e {
                iotafs_store::StoreError::NotFound(_) => "not_found",
                _ => "store_error",
            },
            Self::Catalog(e) => match e {
                iotafs_catalog::CatalogError::NotFound(_) => "not_found",
                iotafs_catalog::CatalogError::MissingChunks { .. } => "missing_chunk",
                iotafs_catalog::CatalogError::Constraint(_) => "conflict",
                _ => "catalog_error",
            },
            Self::Core(e) => match e {
                iotafs_core::Error::Corruption(_) => "corruption",
                iotafs_core::Error::PackTooLarge { .. } => "pack_too_large",
                _ => "bad_request",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(e) => match e {
                iotafs_store::StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                iotafs_store::StoreError::InvalidKey(_)
                | iotafs_store::StoreError::InvalidRange(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Catalog(e) => match e {
                iotafs_catalog::CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
                iotafs_catalog::CatalogError::MissingChunks { .. } => StatusCode::NOT_FOUND,
                iotafs_catalog::CatalogError::Constraint(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(e) => match e {
                iotafs_core::Error::PackTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                iotafs_core::Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
