//! Shared-secret admin guard.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: the time taken does not depend on where the
//!   first mismatching byte is
//! - **Single static secret**: configured once at construction and immutable
//!   afterwards
//!
//! Clients present the secret in the `X-Api-Key` header:
//!
//! ```bash
//! curl -H "X-Api-Key: your-secret-key" http://localhost:3000/admin/limiter
//! ```
//!
//! A missing header is compared as an empty value, so it is rejected like any
//! other mismatch. A length mismatch is rejected too; the comparison leaks
//! the secret's length, which is the usual constant-time-compare trade-off.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::OriginalUri;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower::{Layer, Service};

use super::ip::{IpFormatter, client_ip};
use crate::context::RequestContext;
use crate::logging::{Field, Logger};
use crate::metrics;

/// Header carrying the admin secret.
pub const ADMIN_KEY_HEADER: &str = "x-api-key";

/// Error type for admin guard configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdminGuardError {
    /// An empty secret would admit every request without the header.
    #[error("admin secret must not be empty")]
    EmptySecret,
}

/// Admin guard layer for Tower middleware stack.
#[derive(Clone)]
pub struct AdminGuardLayer {
    secret: Arc<[u8]>,
    logger: Logger,
    ip_format: IpFormatter,
}

impl AdminGuardLayer {
    /// Guard requests with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`AdminGuardError::EmptySecret`] for an empty secret.
    pub fn new(secret: impl AsRef<[u8]>, logger: Logger) -> Result<Self, AdminGuardError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(AdminGuardError::EmptySecret);
        }

        Ok(Self {
            secret: Arc::from(secret),
            logger,
            ip_format: IpFormatter::Raw,
        })
    }

    /// Log anonymized caller addresses in rejection warnings.
    pub fn anonymize_ip(mut self, anonymize: bool) -> Self {
        self.ip_format = IpFormatter::from_flag(anonymize);
        self
    }
}

impl std::fmt::Debug for AdminGuardLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGuardLayer")
            .field("secret", &"[redacted]")
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for AdminGuardLayer {
    type Service = AdminGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminGuardService {
            inner,
            secret: self.secret.clone(),
            logger: self.logger.clone(),
            ip_format: self.ip_format,
        }
    }
}

/// Admin guard service wrapper.
#[derive(Clone)]
pub struct AdminGuardService<S> {
    inner: S,
    secret: Arc<[u8]>,
    logger: Logger,
    ip_format: IpFormatter,
}

impl<S> Service<Request<Body>> for AdminGuardService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let provided = req
            .headers()
            .get(ADMIN_KEY_HEADER)
            .map(|value| value.as_bytes())
            .unwrap_or_default();

        if constant_time_eq(provided, &self.secret) {
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);
            return Box::pin(async move { inner.call(req).await });
        }

        let cx = RequestContext::of(&req);
        let ip = self.ip_format.format(&self.logger, &cx, &client_ip(&req));
        self.logger.warn(
            &cx,
            "Invalid API key",
            vec![
                Field::new("method", req.method().as_str().to_string()),
                Field::new("url", request_url(&req)),
                Field::new("ip", ip),
            ],
        );
        metrics::record_admin_rejected();

        Box::pin(async move { Ok(forbidden()) })
    }
}

/// The URL as the client sent it, before any `nest_service` prefix stripping.
fn request_url(req: &Request<Body>) -> String {
    req.extensions()
        .get::<OriginalUri>()
        .map_or_else(|| req.uri().to_string(), |uri| uri.0.to_string())
}

/// Constant-time byte comparison. Different lengths never match.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Build a forbidden (403) response.
fn forbidden() -> Response<Body> {
    (
        StatusCode::FORBIDDEN,
        StatusCode::FORBIDDEN.canonical_reason().unwrap_or("Forbidden"),
    )
        .into_response()
}
