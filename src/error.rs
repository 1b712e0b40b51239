use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Per-request errors with appropriate HTTP status codes.
///
/// Client errors carry a short message that is safe to show. The only
/// server error, [`AppError::Encode`], exposes the encoder's error text,
/// which is acceptable for an internally facing service.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("Invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Encode(serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::UnsupportedMediaType(msg) => {
                tracing::debug!(error = %self, "Rejected request media type");
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg.clone()).into_response()
            }
            AppError::InvalidJson(e) => {
                tracing::debug!(error = %self, "Rejected request body");
                (StatusCode::BAD_REQUEST, sanitize_serde_error(e)).into_response()
            }
            AppError::BadRequest(msg) => {
                tracing::debug!(error = %self, "Rejected request");
                (StatusCode::BAD_REQUEST, msg.clone()).into_response()
            }
            AppError::Encode(e) => {
                tracing::error!(error = %e, "Failed to encode response");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Operational errors from configuring, starting or stopping the server.
///
/// None of these are retried; they end the run loop.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(#[source] io::Error),

    #[error("http shutdown error: connections still open after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Server already started")]
    AlreadyStarted,
}
