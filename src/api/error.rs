//! API error type and its JSON failure body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::pipeline::extraction::{ErrorKind, ExtractionError};
use crate::pipeline::material::MaterialError;
use crate::pipeline::processor::ProcessingError;

/// Failure body: `{"success": false, "error": ..., "code": ...}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    UploadTooLarge { size: usize, limit: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Status for an extraction failure, keyed on its kind.
pub fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Input | ErrorKind::UnsupportedType | ErrorKind::PayloadTooLarge => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::TransientProvider
        | ErrorKind::ResourceUnavailable
        | ErrorKind::InsufficientText
        | ErrorKind::ExtractionFailed
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::Input.as_code(),
                detail.clone(),
            ),
            ApiError::UploadTooLarge { .. } => (
                StatusCode::BAD_REQUEST,
                ErrorKind::PayloadTooLarge.as_code(),
                self.to_string(),
            ),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone()),
            ApiError::Extraction(err) => {
                let kind = err.kind();
                let status = status_for_kind(kind);
                if status.is_server_error() {
                    tracing::warn!(code = kind.as_code(), error = %err, "Extraction request failed");
                }
                if kind == ErrorKind::Internal {
                    tracing::error!(error = %err, "Extraction internal error");
                    (status, kind.as_code(), "An internal error occurred".to_string())
                } else {
                    (status, kind.as_code(), err.to_string())
                }
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal.as_code(),
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            success: false,
            error: message,
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<MaterialError> for ApiError {
    fn from(err: MaterialError) -> Self {
        match err {
            MaterialError::InvalidId(_) => ApiError::BadRequest(err.to_string()),
            MaterialError::NotFound(id) => ApiError::NotFound(format!("Material {id}")),
            MaterialError::Metadata(_) | MaterialError::Io(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<ProcessingError> for ApiError {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::Material(e) => e.into(),
            ProcessingError::Extraction(e) => e.into(),
        }
    }
}
