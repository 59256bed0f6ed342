//! Mapping of library errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::Error;

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code for the wrapped error
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Config(_) => StatusCode::NOT_IMPLEMENTED,
            Error::PayloadFormat(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self.0 {
            Error::Validation(details) => json!({"error": "Invalid request", "details": details}),
            Error::Unauthorized => json!({"error": "Unauthorized"}),
            Error::Forbidden(message) | Error::Config(message) => json!({"error": message}),
            Error::NotFound { .. } => json!({"error": self.0.to_string()}),
            Error::PayloadFormat(message) => json!({"error": "Bad Gateway", "details": message}),
            Error::Upstream { message, .. } => json!({"error": message}),
            Error::Transaction(details) => {
                error!(error = %details, "Sync transaction rolled back");
                json!({"error": "Database transaction failed", "details": details})
            }
            other => {
                error!(error = %other, "Request failed");
                json!({"error": "Internal Server Error"})
            }
        };
        (status, Json(body)).into_response()
    }
}
