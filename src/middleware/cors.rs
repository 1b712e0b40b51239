//! Permissive CORS headers.
//!
//! Every response gets:
//!
//! - `Access-Control-Allow-Origin`: the request's `Origin`, or `*` without one
//! - `Access-Control-Allow-Headers: *`
//! - `Access-Control-Allow-Methods: POST, GET, PUT, PATCH, DELETE, OPTIONS`
//! - `Access-Control-Max-Age: 86400`
//! - `Access-Control-Allow-Credentials: true`, only when enabled
//!
//! `OPTIONS` requests are answered here with `204 No Content` and never reach
//! the application. There is no per-origin allow-list: any origin is echoed.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, HeaderMap, HeaderValue, ORIGIN,
};
use axum::http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};

const ALLOW_METHODS: HeaderValue =
    HeaderValue::from_static("POST, GET, PUT, PATCH, DELETE, OPTIONS");
const MAX_AGE: HeaderValue = HeaderValue::from_static("86400");
const ANY: HeaderValue = HeaderValue::from_static("*");
const TRUE: HeaderValue = HeaderValue::from_static("true");

/// CORS layer for Tower middleware stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorsLayer {
    allow_credentials: bool,
}

impl CorsLayer {
    pub fn new(allow_credentials: bool) -> Self {
        Self { allow_credentials }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            inner,
            allow_credentials: self.allow_credentials,
        }
    }
}

/// CORS service wrapper.
#[derive(Clone)]
pub struct CorsService<S> {
    inner: S,
    allow_credentials: bool,
}

impl<S> Service<Request<Body>> for CorsService<S>
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
        let origin = req.headers().get(ORIGIN).cloned().unwrap_or(ANY);
        let allow_credentials = self.allow_credentials;

        if req.method() == Method::OPTIONS {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            apply_headers(response.headers_mut(), origin, allow_credentials);
            return Box::pin(async move { Ok(response) });
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            apply_headers(response.headers_mut(), origin, allow_credentials);
            Ok(response)
        })
    }
}

fn apply_headers(headers: &mut HeaderMap, origin: HeaderValue, allow_credentials: bool) {
    if allow_credentials {
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, TRUE);
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, ANY);
    headers.insert(ACCESS_CONTROL_MAX_AGE, MAX_AGE);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS);
}
