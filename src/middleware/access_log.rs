//! Structured access logging.
//!
//! [`AccessLogLayer`] emits exactly one record per request, with message
//! `"Request executed"` and fields:
//!
//! | Field | Value |
//! |-------|-------|
//! | `method` | Request method |
//! | `url` | Request URI as received |
//! | `status` | Response status code |
//! | `bytes` | Response body bytes actually written |
//! | `duration_seconds` | From entering the layer until the body finished |
//! | `ip` | Caller address (optionally anonymized) |
//!
//! `request_id` is added by the logger's sink, not by this layer.
//!
//! The response body is wrapped in a counting body that forwards frames
//! untouched. The record is emitted when the body reports its end, fails, or
//! is dropped (client went away, or the body was never polled because it was
//! empty), whichever comes first. Headers and content are never modified.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tower::{Layer, Service};

use super::ip::{IpFormatter, client_ip};
use crate::context::RequestContext;
use crate::logging::{Field, Logger};
use crate::metrics;

/// Message of every access record.
pub const ACCESS_LOG_MESSAGE: &str = "Request executed";

/// Access logging layer for Tower middleware stack.
#[derive(Clone)]
pub struct AccessLogLayer {
    logger: Logger,
    ip_format: IpFormatter,
}

impl AccessLogLayer {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            ip_format: IpFormatter::Raw,
        }
    }

    /// Log anonymized caller addresses.
    pub fn anonymize_ip(mut self, anonymize: bool) -> Self {
        self.ip_format = IpFormatter::from_flag(anonymize);
        self
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            logger: self.logger.clone(),
            ip_format: self.ip_format,
        }
    }
}

/// Access logging service wrapper.
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    logger: Logger,
    ip_format: IpFormatter,
}

impl<S> Service<Request<Body>> for AccessLogService<S>
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
        let start = Instant::now();
        let cx = RequestContext::of(&req);
        let ip = self.ip_format.format(&self.logger, &cx, &client_ip(&req));
        let pending = PendingRecord {
            logger: self.logger.clone(),
            cx,
            method: req.method().as_str().to_string(),
            url: req.uri().to_string(),
            ip,
            start,
            status: 0,
        };

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let response = inner.call(req).await?;
            let (parts, body) = response.into_parts();
            let pending = PendingRecord {
                status: parts.status.as_u16(),
                ..pending
            };
            Ok(Response::from_parts(
                parts,
                Body::new(CountingBody::new(body, pending)),
            ))
        })
    }
}

/// Everything known about a request before its body has been written.
struct PendingRecord {
    logger: Logger,
    cx: RequestContext,
    method: String,
    url: String,
    ip: String,
    start: Instant,
    status: u16,
}

impl PendingRecord {
    fn emit(self, bytes: u64) {
        let duration = self.start.elapsed().as_secs_f64();
        metrics::record_request(&self.method, self.status, bytes, duration);

        self.logger.info(
            &self.cx,
            ACCESS_LOG_MESSAGE,
            vec![
                Field::new("method", self.method),
                Field::new("url", self.url),
                Field::new("status", self.status),
                Field::new("bytes", bytes),
                Field::new("duration_seconds", duration),
                Field::new("ip", self.ip),
            ],
        );
    }
}

/// Response body that counts data bytes and logs once when finished.
struct CountingBody {
    inner: Body,
    bytes: u64,
    pending: Option<PendingRecord>,
}

impl CountingBody {
    fn new(inner: Body, pending: PendingRecord) -> Self {
        Self {
            inner,
            bytes: 0,
            pending: Some(pending),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.emit(self.bytes);
        }
    }
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;

    use axum::http::StatusCode;
    use serde_json::Value;
    use tower::{ServiceExt, service_fn};

    use super::*;
    use crate::logging::{CaptureSink, RequestIdSink};
    use crate::middleware::RequestIdLayer;

    async fn hello(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("x-custom", "kept")
            .body(Body::from("hello"))
            .unwrap())
    }

    fn request() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/things?x=1")
            .header("x-envoy-external-address", "86.76.17.1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_record_with_all_fields() {
        let capture = CaptureSink::new();
        let svc = AccessLogLayer::new(Logger::new(capture.clone())).layer(service_fn(hello));

        let response = svc.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-custom"], "kept");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");

        let records = capture.records_with_message(ACCESS_LOG_MESSAGE);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.field("method"), Some(&Value::from("POST")));
        assert_eq!(record.field("url"), Some(&Value::from("/things?x=1")));
        assert_eq!(record.field("status"), Some(&Value::from(201)));
        assert_eq!(record.field("bytes"), Some(&Value::from(5)));
        assert_eq!(record.field("ip"), Some(&Value::from("86.76.17.1")));
        assert!(record.field("duration_seconds").unwrap().as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_dropped_body_still_logs_once() {
        let capture = CaptureSink::new();
        let svc = AccessLogLayer::new(Logger::new(capture.clone())).layer(service_fn(hello));

        let response = svc.oneshot(request()).await.unwrap();
        assert!(capture.is_empty());
        drop(response);

        let records = capture.records_with_message(ACCESS_LOG_MESSAGE);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("bytes"), Some(&Value::from(0)));
    }

    #[tokio::test]
    async fn test_empty_body_logs_once() {
        let capture = CaptureSink::new();
        let svc = AccessLogLayer::new(Logger::new(capture.clone())).layer(service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::empty())) },
        ));

        let response = svc.oneshot(request()).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
        assert_eq!(capture.records_with_message(ACCESS_LOG_MESSAGE).len(), 1);
    }

    #[tokio::test]
    async fn test_anonymized_ip() {
        let capture = CaptureSink::new();
        let svc = AccessLogLayer::new(Logger::new(capture.clone()))
            .anonymize_ip(true)
            .layer(service_fn(hello));

        let response = svc.oneshot(request()).await.unwrap();
        drop(response);

        let record = &capture.records_with_message(ACCESS_LOG_MESSAGE)[0];
        assert_eq!(record.field("ip"), Some(&Value::from("86.76.0.0")));
    }

    #[tokio::test]
    async fn test_request_id_added_by_enriching_sink() {
        let capture = CaptureSink::new();
        let logger = Logger::new(RequestIdSink::wrap(capture.clone()));
        let svc = RequestIdLayer::new()
            .layer(AccessLogLayer::new(logger).layer(service_fn(hello)));

        let response = svc.oneshot(request()).await.unwrap();
        let header = response.headers()["x-request-id"].to_str().unwrap().to_string();
        drop(response);

        let record = &capture.records_with_message(ACCESS_LOG_MESSAGE)[0];
        assert_eq!(record.field("request_id"), Some(&Value::from(header)));
    }
}
