//! HTTP-facing error type for the management API.
//!
//! Adapted from `server/error.rs::ServerError`: logs the full chain on
//! 5xx, returns a clean `{kind, message}` body to the client.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

use crate::model::ErrorKind;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    pub source: Option<anyhow::Error>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_anyhow(
        source: anyhow::Error,
        status: StatusCode,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::Conflict, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Config, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorKind::Conflict, message)
    }

    pub fn internal(source: anyhow::Error, message: impl Into<String>) -> Self {
        Self::from_anyhow(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Persistence,
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = self.status.as_u16(),
                kind = %self.kind,
                message = %self.message,
                error = ?self.source,
                "management API error"
            );
        }

        let body = Json(json!({
            "kind": self.kind,
            "message": self.message,
        }));

        (self.status, body).into_response()
    }
}

pub trait ApiErrorExt<T> {
    fn internal_err(self, message: impl Into<String>) -> Result<T, ApiError>;
}

impl<T, E> ApiErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn internal_err(self, message: impl Into<String>) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::internal(e.into(), message))
    }
}
