//! # gatehouse
//!
//! Composable HTTP middleware for Axum/Tower services, and a small server
//! that wires it together:
//!
//! - **Correlation**: A short request id per request, carried in an explicit
//!   [`RequestContext`] and injected into every log record by [`logging::RequestIdSink`]
//! - **Observability**: One structured access record per request, Prometheus metrics
//! - **Admission control**: Per-client token buckets, constant-time admin key gating
//! - **Lifecycle**: Bounded graceful shutdown driven by a `CancellationToken`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Server (listener, shutdown)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware chain (Request ID → Access Log → Rate Limit)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Write timeout → CORS → Read timeout                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Router (health, echo, admin behind Admin Guard)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gatehouse::{AppState, Config, Logger, Server, build_middlewares, build_router};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gatehouse::ServerError> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config, Logger::tracing())?;
//!
//!     let chain = build_middlewares(&state);
//!     let server = Server::new(
//!         build_router(state.clone())?,
//!         chain.as_slice(),
//!         state.config.server_options(),
//!     );
//!
//!     let token = CancellationToken::new();
//!     gatehouse::utils::cancel_on_signal(token.clone());
//!     server.run(&state.config.server_addr(), token).await
//! }
//! ```
//!
//! ## Composing your own chain
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use gatehouse::middleware::{MiddlewareChain, RateLimitLayer};
//! use gatehouse::Logger;
//!
//! # fn build() -> Result<(), gatehouse::middleware::RateLimitError> {
//! let logger = Logger::tracing();
//! let chain = MiddlewareChain::with_defaults(logger.clone())
//!     .layer(RateLimitLayer::new(5.0, 10, logger)?);
//! let handler = chain.apply(Router::new().route("/", get(|| async { "ok" })));
//! # let _ = handler;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod json;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, LogFormat};
pub use context::{RequestContext, RequestId};
pub use error::{AppError, AppResult, ServerError};
pub use logging::Logger;
pub use routes::{build_middlewares, build_router};
pub use server::{Server, ServerOptions, ServerState};
pub use state::AppState;
