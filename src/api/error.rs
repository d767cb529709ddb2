//! JSON error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::BundlecastError;

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable code, e.g. `not_found`
    code: &'static str,
    message: String,
}

/// Error returned by route handlers
#[derive(Debug)]
pub struct ApiError(pub BundlecastError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(BundlecastError::InvalidInput(message.into()))
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            BundlecastError::NotFound { .. } => "not_found",
            BundlecastError::InvalidInput(_) => "bad_request",
            BundlecastError::InvalidSignature => "invalid_signature",
            BundlecastError::Expired => "expired",
            BundlecastError::Conflict(_) => "conflict",
            BundlecastError::BuildInProgress(_) => "build_in_progress",
            BundlecastError::ObjectStore(_) | BundlecastError::Distribution(_) => "upstream_error",
            _ => "internal_error",
        }
    }
}

impl From<BundlecastError> for ApiError {
    fn from(err: BundlecastError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
