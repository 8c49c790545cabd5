//! API error handling.

use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::PoolError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// API error type that converts to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        // Preserves 413 for over-limit bodies, 400 for malformed uploads.
        Self::new(err.status(), "BAD_UPLOAD", err.body_text())
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let (status, code) = match &err {
            PoolError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED"),
            PoolError::QueuedTooLong => (StatusCode::GATEWAY_TIMEOUT, "QUEUED_TOO_LONG"),
            PoolError::OcrTimeout => (StatusCode::GATEWAY_TIMEOUT, "OCR_TIMEOUT"),
            PoolError::WorkerCrashed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "WORKER_CRASHED")
            }
            PoolError::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, "OCR_FAILED"),
            PoolError::PoolNotReady | PoolError::NoWorkerStarted => {
                (StatusCode::SERVICE_UNAVAILABLE, "POOL_NOT_READY")
            }
            PoolError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        Self::new(status, code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_documented_statuses() {
        let cases = [
            (PoolError::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (PoolError::QueuedTooLong, StatusCode::GATEWAY_TIMEOUT),
            (PoolError::OcrTimeout, StatusCode::GATEWAY_TIMEOUT),
            (
                PoolError::WorkerCrashed { exit_code: Some(9) },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PoolError::Engine("corrupt PDF".to_owned()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (PoolError::PoolNotReady, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
