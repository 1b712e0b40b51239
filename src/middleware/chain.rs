//! Middleware composition.
//!
//! A [`Middleware`] turns the next [`Handler`] into a new handler. It may
//! forward the request unchanged, forward it with extra request-scoped data
//! (extensions), or answer it itself without calling the next handler.
//!
//! [`compose`] applies a list of middleware to a terminal handler so that the
//! first one listed is outermost:
//!
//! ```text
//! compose(H, [A, B])
//!
//! request  → A → B → H
//! response ← A ← B ← H
//! ```
//!
//! If `B` short-circuits, `H` never runs, but `A` still sees `B`'s response.
//!
//! Composition happens once, at startup. The resulting handler is cloned per
//! connection by the server; nothing is recomposed per request.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use super::{AccessLogLayer, RequestIdLayer};
use crate::logging::Logger;

/// Type-erased request handler.
pub type Handler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// A function from the next handler to a new handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Erase any compatible service into a [`Handler`].
pub fn handler<S>(service: S) -> Handler
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(service)
}

/// Middleware from a Tower [`Layer`].
pub fn from_layer<L>(layer: L) -> Middleware
where
    L: Layer<Handler> + Send + Sync + 'static,
    L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    <L::Service as Service<Request<Body>>>::Future: Send + 'static,
{
    Arc::new(move |next: Handler| handler(layer.layer(next)))
}

/// Middleware from a plain function.
pub fn from_fn<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `terminal` in `middlewares`, first listed outermost.
pub fn compose(terminal: Handler, middlewares: &[Middleware]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// The middleware every server installs unless told otherwise:
/// request correlation, then access logging.
pub fn default_middlewares(logger: Logger) -> Vec<Middleware> {
    vec![
        from_layer(RequestIdLayer::new()),
        from_layer(AccessLogLayer::new(logger)),
    ]
}

/// Ordered, append-only list of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from [`default_middlewares`].
    pub fn with_defaults(logger: Logger) -> Self {
        Self {
            middlewares: default_middlewares(logger),
        }
    }

    /// Append `middleware` inside everything added so far.
    pub fn push(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Append a Tower layer.
    pub fn layer<L>(self, layer: L) -> Self
    where
        L: Layer<Handler> + Send + Sync + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send + 'static,
    {
        self.push(from_layer(layer))
    }

    /// Append `layer` only when present.
    pub fn option_layer<L>(self, layer: Option<L>) -> Self
    where
        L: Layer<Handler> + Send + Sync + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send + 'static,
    {
        match layer {
            Some(layer) => self.layer(layer),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn as_slice(&self) -> &[Middleware] {
        &self.middlewares
    }

    /// Compose the chain around `terminal`.
    pub fn apply<S>(&self, terminal: S) -> Handler
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        compose(handler(terminal), &self.middlewares)
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.middlewares.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use axum::http::StatusCode;
    use tower::{ServiceExt, service_fn};

    use super::*;
    use crate::logging::CaptureSink;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracer(name: &'static str, trace: Trace) -> Middleware {
        from_fn(move |next: Handler| {
            let trace = trace.clone();
            handler(service_fn(move |req: Request<Body>| {
                let trace = trace.clone();
                let next = next.clone();
                async move {
                    trace.lock().unwrap().push(format!("{name} in"));
                    let response = next.oneshot(req).await?;
                    trace
                        .lock()
                        .unwrap()
                        .push(format!("{name} out {}", response.status().as_u16()));
                    Ok::<_, Infallible>(response)
                }
            }))
        })
    }

    fn short_circuit(name: &'static str, trace: Trace) -> Middleware {
        from_fn(move |_next: Handler| {
            let trace = trace.clone();
            handler(service_fn(move |_req: Request<Body>| {
                let trace = trace.clone();
                async move {
                    trace.lock().unwrap().push(format!("{name} in"));
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::FORBIDDEN;
                    Ok::<_, Infallible>(response)
                }
            }))
        })
    }

    fn terminal(trace: Trace) -> Handler {
        handler(service_fn(move |_req: Request<Body>| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push("H".to_string());
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        }))
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_first_listed_is_outermost() {
        let trace: Trace = Arc::default();
        let composed = compose(
            terminal(trace.clone()),
            &[tracer("A", trace.clone()), tracer("B", trace.clone())],
        );

        let response = composed.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *trace.lock().unwrap(),
            ["A in", "B in", "H", "B out 200", "A out 200"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_but_outer_sees_response() {
        let trace: Trace = Arc::default();
        let composed = compose(
            terminal(trace.clone()),
            &[tracer("A", trace.clone()), short_circuit("B", trace.clone())],
        );

        let response = composed.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*trace.lock().unwrap(), ["A in", "B in", "A out 403"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let trace: Trace = Arc::default();
        let composed = MiddlewareChain::new().apply(terminal(trace.clone()));

        composed.oneshot(request()).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), ["H"]);
    }

    #[tokio::test]
    async fn test_chain_builder_preserves_order() {
        let trace: Trace = Arc::default();
        let chain = MiddlewareChain::new()
            .push(tracer("A", trace.clone()))
            .push(tracer("B", trace.clone()))
            .push(tracer("C", trace.clone()));
        assert_eq!(chain.len(), 3);

        chain
            .apply(terminal(trace.clone()))
            .oneshot(request())
            .await
            .unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            ["A in", "B in", "C in", "H", "C out 200", "B out 200", "A out 200"]
        );
    }

    #[tokio::test]
    async fn test_composed_handler_is_reusable() {
        let trace: Trace = Arc::default();
        let composed = compose(terminal(trace.clone()), &[tracer("A", trace.clone())]);

        for _ in 0..3 {
            composed.clone().oneshot(request()).await.unwrap();
        }
        assert_eq!(trace.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_default_middlewares_log_with_request_id() {
        let capture = CaptureSink::new();
        let logger = Logger::new(crate::logging::RequestIdSink::wrap(capture.clone()));
        let chain = MiddlewareChain::with_defaults(logger);
        assert_eq!(chain.len(), 2);

        let response = chain
            .apply(terminal(Arc::default()))
            .oneshot(request())
            .await
            .unwrap();
        let id = response.headers()["x-request-id"].to_str().unwrap().to_string();
        drop(response);

        let records = capture.records_with_message("Request executed");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("request_id"), Some(&id.into()));
    }
}
