//! Application routing and the server-wide middleware chain.
//!
//! # Middleware Chain (first listed runs first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id header, RequestContext extension
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Access Log     │ ← One record per request
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded (when RATE_LIMIT_RPS > 0)
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Router ── /admin/* ── Admin Guard ← 403 on key mismatch
//! ```
//!
//! CORS and the request timeouts are added by [`Server`](crate::server::Server)
//! between the chain and the router.
//!
//! # Route Groups
//!
//! - `/health` - Liveness
//! - `/echo` - Strict JSON echo
//! - `/admin/limiter` - Limiter snapshot (only when `ADMIN_API_KEY` is set)

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::error::ServerError;
use crate::handlers;
use crate::middleware::{
    AccessLogLayer, AdminGuardLayer, MiddlewareChain, RateLimitLayer, RequestIdLayer, compose,
    from_layer, handler,
};
use crate::state::AppState;

/// Build the application router.
///
/// The admin routes are mounted, behind their own guard, only when an admin
/// key is configured.
///
/// # Errors
///
/// Returns `ServerError::Config` if the admin guard rejects the configured key.
pub fn build_router(state: AppState) -> Result<Router, ServerError> {
    let config = &state.config;

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/echo", post(handlers::echo));

    match &config.admin_api_key {
        Some(key) => {
            let guard = AdminGuardLayer::new(key, state.logger.clone())
                .map_err(|e| ServerError::Config(e.to_string()))?
                .anonymize_ip(config.log_anonymize_ip);
            let admin = Router::new()
                .route("/limiter", get(handlers::limiter_status))
                .with_state(state.clone());

            info!("Admin routes enabled");
            router = router.nest_service("/admin", compose(handler(admin), &[from_layer(guard)]));
        }
        None => info!("Admin routes disabled (no ADMIN_API_KEY set)"),
    }

    Ok(router.with_state(state))
}

/// Build the server-wide chain: request id, access log, then rate limiting
/// when a limiter is configured.
pub fn build_middlewares(state: &AppState) -> MiddlewareChain {
    let anonymize = state.config.log_anonymize_ip;

    let rate_limit = state.limiter.clone().map(|registry| {
        info!(
            rps = registry.rate(),
            burst = registry.burst(),
            "Rate limiting enabled"
        );
        RateLimitLayer::with_registry(registry, state.logger.clone()).anonymize_ip(anonymize)
    });
    if rate_limit.is_none() {
        info!("Rate limiting disabled (RATE_LIMIT_RPS=0)");
    }

    MiddlewareChain::new()
        .layer(RequestIdLayer::new())
        .layer(AccessLogLayer::new(state.logger.clone()).anonymize_ip(anonymize))
        .option_layer(rate_limit)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::logging::{CaptureSink, Logger, RequestIdSink};
    use crate::middleware::{ADMIN_KEY_HEADER, ACCESS_LOG_MESSAGE, Handler, REQUEST_ID_HEADER};
    use crate::server::Server;

    const ADMIN_KEY: &str = "s3cret";

    fn app(config: Config, capture: &CaptureSink) -> Handler {
        let logger = Logger::new(RequestIdSink::wrap(capture.clone()));
        let state = AppState::new(config, logger).unwrap();
        let chain = build_middlewares(&state);
        let router = build_router(state.clone()).unwrap();
        Server::new(router, chain.as_slice(), state.config.server_options()).handler()
    }

    fn admin_config() -> Config {
        Config {
            admin_api_key: Some(ADMIN_KEY.to_string()),
            ..Config::default()
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let capture = CaptureSink::new();
        let response = app(Config::default(), &capture)
            .oneshot(get("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let body = json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        let records = capture.records_with_message(ACCESS_LOG_MESSAGE);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("url"), Some(&Value::from("/health")));
        assert_eq!(records[0].field("status"), Some(&Value::from(200)));
    }

    #[tokio::test]
    async fn test_echo_returns_message_and_request_id() {
        let capture = CaptureSink::new();
        let response = app(Config::default(), &capture)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let header_id = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        let body = json(response).await;
        assert_eq!(body["message"], "hello");
        assert_eq!(body["request_id"], header_id.as_str());

        let echo = capture.records_with_message("Echo received");
        assert_eq!(echo.len(), 1);
        assert_eq!(echo[0].field("request_id"), Some(&Value::from(header_id.as_str())));
    }

    #[tokio::test]
    async fn test_echo_rejects_bad_input() {
        let capture = CaptureSink::new();
        let handler = app(Config::default(), &capture);

        let wrong_type = handler
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let unknown_field = handler
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message":"hi","admin":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown_field.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let capture = CaptureSink::new();
        let handler = app(admin_config(), &capture);

        let missing = handler.clone().oneshot(get("/admin/limiter")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::FORBIDDEN);

        let wrong = handler
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/limiter")
                    .header(ADMIN_KEY_HEADER, "s3creT")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let ok = handler
            .oneshot(
                Request::builder()
                    .uri("/admin/limiter")
                    .header(ADMIN_KEY_HEADER, ADMIN_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json(ok).await;
        assert_eq!(body["enabled"], true);
        assert_eq!(body["burst"], 20);
        // Every request so far came without a peer address: one shared key.
        assert_eq!(body["keys"], 1);

        let warnings = capture.records_with_message("Invalid API key");
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].field("url"), Some(&Value::from("/admin/limiter")));
    }

    #[tokio::test]
    async fn test_admin_routes_absent_without_key() {
        let capture = CaptureSink::new();
        let response = app(Config::default(), &capture)
            .oneshot(get("/admin/limiter"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_all_routes() {
        let capture = CaptureSink::new();
        let config = Config {
            rate_limit_burst: 2,
            ..Config::default()
        };
        let handler = app(config, &capture);

        for _ in 0..2 {
            let response = handler.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let denied = handler.oneshot(get("/health")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // The access log is outside the limiter and still sees the 429.
        let records = capture.records_with_message(ACCESS_LOG_MESSAGE);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].field("status"), Some(&Value::from(429)));
    }

    #[tokio::test]
    async fn test_no_limiter_when_disabled() {
        let capture = CaptureSink::new();
        let config = Config {
            rate_limit_rps: 0.0,
            rate_limit_burst: 1,
            ..Config::default()
        };
        let handler = app(config, &capture);

        for _ in 0..5 {
            let response = handler.clone().oneshot(get("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
