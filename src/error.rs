//! Handler errors and their HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::storage::StorageError;

/// Body returned when the storage probe fails
pub const STORAGE_ERROR_BODY: &str = "Database Connection Error";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Storage unreachable: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Storage(e) => {
                tracing::error!(error = %e, "Storage health check failed");
                (StatusCode::INTERNAL_SERVER_ERROR, STORAGE_ERROR_BODY).into_response()
            }
        }
    }
}
