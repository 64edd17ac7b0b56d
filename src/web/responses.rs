//! Standardized JSON envelope and error mapping
//!
//! Every API endpoint answers `{code, message, data}`; `code` 0 means
//! success. [`AppError`] maps onto HTTP status codes here so handlers can
//! simply return `Result<_, AppError>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::errors::{AppError, ResolveError, StreamError};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 0,
        message: "ok".to_string(),
        data: Some(data),
    })
}

pub fn ok_message(message: impl Into<String>) -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        code: 0,
        message: message.into(),
        data: None,
    })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Configuration { .. } => StatusCode::BAD_REQUEST,
            AppError::Stream(e) => stream_status(e),
            AppError::Resolve(e) => match e {
                ResolveError::UnsupportedType { .. } => StatusCode::BAD_REQUEST,
                ResolveError::EmptyStream => StatusCode::NOT_FOUND,
                ResolveError::BadUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Recorder(_) | AppError::Database(_) | AppError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            warn!("request failed: {}", self);
        }

        let body = Json(json!({
            "code": 1,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Upstream failures echo the upstream status class back to the player: an
/// exhausted retry ends up as a 5xx with the upstream status in the message.
fn stream_status(error: &StreamError) -> StatusCode {
    match error {
        StreamError::RoomOffline => StatusCode::NOT_FOUND,
        StreamError::InvalidRoom { .. } | StreamError::InvalidPlatform(_) => {
            StatusCode::BAD_REQUEST
        }
        StreamError::Status(_) | StreamError::Http(_) => StatusCode::BAD_GATEWAY,
        StreamError::Parse { .. } | StreamError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_maps_to_not_found_and_upstream_failures_to_bad_gateway() {
        assert_eq!(stream_status(&StreamError::RoomOffline), StatusCode::NOT_FOUND);
        assert_eq!(stream_status(&StreamError::Status(403)), StatusCode::BAD_GATEWAY);
        assert_eq!(
            stream_status(&StreamError::InvalidPlatform("x".to_string())),
            StatusCode::BAD_REQUEST
        );
    }
}
