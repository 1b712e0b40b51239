//! Per-client rate limiting using the token bucket algorithm.
//!
//! # Algorithm
//!
//! Every client key owns one [`TokenBucket`]:
//!
//! - A bucket starts full, holding `burst` tokens
//! - On each check, `elapsed * rate` tokens are added, capped at `burst`
//! - A request is admitted if at least one whole token is available, and
//!   consumes it; otherwise it is denied and the bucket is left untouched
//!
//! Denied requests are answered immediately with `429 Too Many Requests`.
//! Nothing is queued or delayed waiting for tokens.
//!
//! # Registry
//!
//! [`LimiterRegistry`] maps client keys to buckets behind one reader/writer
//! lock. Lookups take the read lock; a miss retakes the write lock and checks
//! again before inserting, so concurrent first requests from a new client all
//! end up sharing one bucket.
//!
//! Buckets are never removed unless [`LimiterRegistry::evict_idle`] is called
//! (the server runs it periodically only when `RATE_LIMIT_IDLE_EVICT_SECS` is
//! set). Without eviction, memory grows with the number of distinct clients
//! seen over the process lifetime.
//!
//! # Client Keys
//!
//! Keys come from [`client_ip`](super::ip::client_ip): the
//! `X-Envoy-External-Address` header when present, else the socket peer
//! address. IPv4 and IPv6 keys are opaque strings. If no address can be
//! determined the key is empty, and all such clients share one bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;
use tokio::time::Instant;
use tower::{Layer, Service};

use super::ip::{IpFormatter, client_ip};
use crate::context::RequestContext;
use crate::logging::{Field, Logger};
use crate::metrics;

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RateLimitError {
    /// Refill rate must be a positive, finite number of tokens per second.
    #[error("rate must be a positive finite number of tokens per second, got {0}")]
    InvalidRate(f64),

    /// Burst capacity must allow at least one request.
    #[error("burst must be at least 1")]
    ZeroBurst,
}

// =============================================================================
// Token Bucket
// =============================================================================

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket admission state for one client key.
///
/// Invariant: `0 <= tokens <= burst`. Tokens grow only through refill and
/// shrink only by whole-token consumption in [`allow`](Self::allow).
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket refilling at `rate` tokens per second up to `burst`.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill for elapsed time, then consume one token if available.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available right now (after refill).
    pub fn tokens(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        state.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Full and untouched for at least `max_idle`. Does not refill, so
    /// sweeping never counts as use.
    fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = now.saturating_duration_since(state.last_refill);
        let tokens = (state.tokens + idle.as_secs_f64() * self.rate).min(self.burst);
        tokens >= self.burst && idle >= max_idle
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Instant is monotonic; saturate in case of equal readings.
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        state.last_refill = now;
    }
}

// =============================================================================
// Limiter Registry
// =============================================================================

/// Client key → token bucket, created on first sight of a key.
#[derive(Debug)]
pub struct LimiterRegistry {
    keys: RwLock<HashMap<String, Arc<TokenBucket>>>,
    rate: f64,
    burst: u32,
}

impl LimiterRegistry {
    /// Create an empty registry whose buckets refill at `rate` tokens per
    /// second up to `burst`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if `rate` is not positive and finite, or
    /// `burst` is zero.
    pub fn new(rate: f64, burst: u32) -> Result<Self, RateLimitError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RateLimitError::InvalidRate(rate));
        }
        if burst == 0 {
            return Err(RateLimitError::ZeroBurst);
        }

        Ok(Self {
            keys: RwLock::new(HashMap::new()),
            rate,
            burst,
        })
    }

    /// The bucket for `key`, creating it if this key has never been seen.
    ///
    /// All callers asking for the same key get the same `Arc`.
    pub fn get_limiter(&self, key: &str) -> Arc<TokenBucket> {
        {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(limiter) = keys.get(key) {
                return limiter.clone();
            }
        }

        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the two locks.
        if let Some(limiter) = keys.get(key) {
            return limiter.clone();
        }

        let limiter = Arc::new(TokenBucket::new(self.rate, self.burst));
        keys.insert(key.to_string(), limiter.clone());
        metrics::set_rate_limiter_keys(keys.len());
        limiter
    }

    /// Check admission for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.get_limiter(key).allow()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Remove buckets that are full and have not been checked for at least
    /// `max_idle`. Returns the number of keys removed.
    ///
    /// Removing such a bucket is unobservable to its client: a new bucket
    /// created later starts full, exactly like the evicted one would be.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let before = keys.len();
        keys.retain(|_, bucket| !bucket.is_idle(now, max_idle));
        let removed = before - keys.len();
        if removed > 0 {
            metrics::set_rate_limiter_keys(keys.len());
        }
        removed
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

/// Rate limiting layer for Tower middleware stack.
///
/// Each layer owns one [`LimiterRegistry`]; services produced by the layer
/// share it.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(10.0, 20, logger)?; // 10 req/s, bursts of 20
/// let chain = MiddlewareChain::new().layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    registry: Arc<LimiterRegistry>,
    logger: Logger,
    ip_format: IpFormatter,
}

impl RateLimitLayer {
    /// Create a per-client rate limit layer.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] for a non-positive rate or zero burst.
    pub fn new(rate: f64, burst: u32, logger: Logger) -> Result<Self, RateLimitError> {
        Ok(Self::with_registry(
            Arc::new(LimiterRegistry::new(rate, burst)?),
            logger,
        ))
    }

    /// Create a layer around an existing registry.
    pub fn with_registry(registry: Arc<LimiterRegistry>, logger: Logger) -> Self {
        Self {
            registry,
            logger,
            ip_format: IpFormatter::Raw,
        }
    }

    /// Log anonymized caller addresses in denial warnings.
    pub fn anonymize_ip(mut self, anonymize: bool) -> Self {
        self.ip_format = IpFormatter::from_flag(anonymize);
        self
    }

    /// The registry shared by every service this layer produces.
    pub fn registry(&self) -> Arc<LimiterRegistry> {
        self.registry.clone()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            registry: self.registry.clone(),
            logger: self.logger.clone(),
            ip_format: self.ip_format,
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    registry: Arc<LimiterRegistry>,
    logger: Logger,
    ip_format: IpFormatter,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let client_ip = client_ip(&req);

        if self.registry.allow(&client_ip) {
            // Swap in a fresh clone so the ready service is the one called.
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);
            return Box::pin(async move { inner.call(req).await });
        }

        let cx = RequestContext::of(&req);
        let ip = self.ip_format.format(&self.logger, &cx, &client_ip);
        self.logger.warn(
            &cx,
            "Too Many Requests",
            vec![
                Field::new("method", req.method().as_str().to_string()),
                Field::new("url", req.uri().to_string()),
                Field::new("ip", ip),
            ],
        );
        metrics::record_rate_limited();

        Box::pin(async move { Ok(too_many_requests()) })
    }
}

/// Build a rate limited (429) response.
fn too_many_requests() -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::TOO_MANY_REQUESTS
            .canonical_reason()
            .unwrap_or("Too Many Requests"),
    )
        .into_response()
}
