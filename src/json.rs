//! JSON request decoding and response encoding.
//!
//! Decoding requires an `application/json` media type (parameters such as
//! `charset` are allowed, the type is compared case-insensitively). Unknown
//! fields are rejected when the target type says so:
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! #[serde(deny_unknown_fields)]
//! struct EchoRequest { message: String }
//!
//! async fn echo(StrictJson(req): StrictJson<EchoRequest>) -> PrettyJson<EchoResponse> { ... }
//! ```
//!
//! Encoding failures become `500 Internal Server Error` with the encoder's
//! error text as the body.

use axum::body::{Body, Bytes};
use axum::extract::{FromRequest, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{AppError, AppResult};

/// Largest JSON body [`read_json`] will buffer.
pub const MAX_JSON_BODY_BYTES: usize = 2 * 1024 * 1024;

const APPLICATION_JSON: &str = "application/json";

/// Check that `headers` declare a JSON body.
pub fn require_json_content_type(headers: &HeaderMap) -> AppResult<()> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type.is_empty() {
        return Err(AppError::UnsupportedMediaType(format!(
            "expect {APPLICATION_JSON} Content-Type, got none"
        )));
    }
    if !media_type.eq_ignore_ascii_case(APPLICATION_JSON) {
        return Err(AppError::UnsupportedMediaType(format!(
            "expect {APPLICATION_JSON} Content-Type, got {media_type}"
        )));
    }

    Ok(())
}

/// Decode a JSON request body into `T`.
pub async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> AppResult<T> {
    require_json_content_type(req.headers())?;

    let bytes = axum::body::to_bytes(req.into_body(), MAX_JSON_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read body: {e}")))?;

    Ok(serde_json::from_slice(&bytes)?)
}

/// Extractor decoding the request body with [`read_json`] semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictJson<T>(pub T);

impl<T, S> FromRequest<S> for StrictJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        require_json_content_type(req.headers())?;

        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;

        Ok(Self(serde_json::from_slice(&bytes)?))
    }
}

/// Encode `value` as compact JSON.
pub fn render_json<T: Serialize + ?Sized>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(body),
        Err(e) => AppError::Encode(e).into_response(),
    }
}

/// Encode `value` as JSON indented with two spaces.
pub fn render_pretty_json<T: Serialize + ?Sized>(value: &T) -> Response {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => json_response(body),
        Err(e) => AppError::Encode(e).into_response(),
    }
}

fn json_response(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON))],
        body,
    )
        .into_response()
}

/// Compact JSON response.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponse<T>(pub T);

impl<T: Serialize> IntoResponse for JsonResponse<T> {
    fn into_response(self) -> Response {
        render_json(&self.0)
    }
}

/// Pretty-printed JSON response.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJson<T>(pub T);

impl<T: Serialize> IntoResponse for PrettyJson<T> {
    fn into_response(self) -> Response {
        render_pretty_json(&self.0)
    }
}
