//! HTTP middleware for correlation, observability, and admission control.
//!
//! - **Request ID**: Per-request correlation id carried in a [`RequestContext`](crate::context::RequestContext)
//! - **Access Log**: One structured record per request
//! - **Rate Limiting**: Per-client token buckets keyed by caller address
//! - **Admin Guard**: Constant-time shared-secret comparison
//! - **CORS**: Permissive cross-origin headers and preflight answers
//!
//! Every component is a Tower [`Layer`](tower::Layer). [`chain`] turns
//! layers into [`Middleware`] values and composes them around a terminal
//! [`Handler`].
//!
//! # Default Chain
//!
//! ```text
//! Request → Request ID → Access Log → Rate Limit → Handler → Response
//!               ↓             ↓            ↓
//!        X-Request-Id    access record  429 Too Many Requests
//! ```
//!
//! The admin guard wraps only the routes it protects:
//!
//! ```text
//! /admin/* → Admin Guard → admin router
//!                ↓
//!           403 Forbidden
//! ```

pub mod access_log;
pub mod admin;
pub mod chain;
pub mod cors;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

pub use access_log::{ACCESS_LOG_MESSAGE, AccessLogLayer};
pub use admin::{ADMIN_KEY_HEADER, AdminGuardError, AdminGuardLayer};
pub use chain::{
    Handler, Middleware, MiddlewareChain, compose, default_middlewares, from_fn, from_layer,
    handler,
};
pub use cors::CorsLayer;
pub use ip::{EXTERNAL_ADDRESS_HEADER, IpFormatter, anonymize, client_ip};
pub use rate_limit::{LimiterRegistry, RateLimitError, RateLimitLayer, TokenBucket};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
