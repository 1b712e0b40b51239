//! Request correlation middleware.
//!
//! # Features
//!
//! - Generates a short random identifier for every incoming request
//! - Stores it in a [`RequestContext`] in the request extensions, where later
//!   middleware and handlers pick it up explicitly
//! - Adds `X-Request-Id` to the response
//!
//! Incoming `X-Request-Id` headers are ignored. The identifier always comes
//! from this process, so a client cannot make its requests collide with
//! someone else's in the logs.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};

use crate::context::{RequestContext, RequestId};

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID layer for Tower middleware stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    /// Create a new request ID layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = RequestId::generate();
        req.extensions_mut()
            .insert(RequestContext::new(request_id.clone()));

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            // Generated ids are always alphanumeric ASCII.
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;

    use tower::{ServiceExt, service_fn};

    use super::*;
    use crate::context::REQUEST_ID_LEN;

    /// Echo the context's identifier as the response body.
    async fn echo_id(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let id = RequestContext::of(&req)
            .request_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        Ok(Response::new(Body::from(id)))
    }

    async fn call(req: Request<Body>) -> (String, String) {
        let response = RequestIdLayer::new()
            .layer(service_fn(echo_id))
            .oneshot(req)
            .await
            .unwrap();
        let header = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (header, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_context_reaches_inner_and_header_matches() {
        let (header, seen) = call(Request::builder().body(Body::empty()).unwrap()).await;
        assert_eq!(header.len(), REQUEST_ID_LEN);
        assert_eq!(header, seen);
    }

    #[tokio::test]
    async fn test_client_supplied_id_is_ignored() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "chosen-by-client")
            .body(Body::empty())
            .unwrap();

        let (header, seen) = call(req).await;
        assert_ne!(header, "chosen-by-client");
        assert_eq!(header, seen);
    }

    #[tokio::test]
    async fn test_each_request_gets_its_own_id() {
        let (a, _) = call(Request::builder().body(Body::empty()).unwrap()).await;
        let (b, _) = call(Request::builder().body(Body::empty()).unwrap()).await;
        assert_ne!(a, b);
    }
}
