//! Request-scoped context carrying the correlation identifier.
//!
//! A [`RequestContext`] is created by [`RequestIdLayer`](crate::middleware::RequestIdLayer)
//! when a request enters the pipeline and stored in the request's extensions.
//! Everything downstream receives it explicitly:
//!
//! - middleware reads it with [`RequestContext::of`]
//! - handlers take it as an extractor argument
//! - log emission takes it by reference (`&RequestContext`)
//!
//! Nothing looks the identifier up from task-local or global state, so one
//! request's identifier can never leak into another request's records.
//!
//! ```rust,ignore
//! async fn handler(cx: RequestContext, State(state): State<AppState>) -> Response {
//!     state.logger.info(&cx, "handling", vec![]);
//!     // ...
//! }
//! ```

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::Request;
use axum::http::request::Parts;
use rand::seq::IndexedRandom;

/// Length of a generated correlation identifier.
pub const REQUEST_ID_LEN: usize = 6;

/// Characters a correlation identifier is drawn from.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Short correlation identifier for one request.
///
/// Six lowercase alphanumeric characters (36^6 ≈ 2.2 billion values). Good
/// enough to tell concurrent requests apart in logs; not a unique or
/// unguessable token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..REQUEST_ID_LEN)
            .map(|_| ALPHABET.choose(&mut rng).copied().map_or('0', char::from))
            .collect();
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// Request-scoped carrier passed by reference to every downstream call.
///
/// An empty context (no identifier) is valid: it is what code outside the
/// request pipeline uses, and log enrichment is a pass-through for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    request_id: Option<RequestId>,
}

impl RequestContext {
    /// A context carrying `request_id`.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
        }
    }

    /// A context with no identifier.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The correlation identifier, if the request went through the decorator.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// The context attached to `req`, or an empty one.
    pub fn of<B>(req: &Request<B>) -> Self {
        req.extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default()
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use axum::body::Body;

    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = RequestId::generate();
        assert_eq!(id.as_str().len(), REQUEST_ID_LEN);
        assert!(
            id.as_str()
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        );
    }

    #[test]
    fn test_generated_ids_are_distinct_over_sample() {
        let ids: HashSet<_> = (0..1000).map(|_| RequestId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_context_of_request_without_extension_is_empty() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(RequestContext::of(&req), RequestContext::empty());
    }

    #[test]
    fn test_context_of_request_with_extension() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(RequestContext::new(RequestId::from("abc123")));

        let cx = RequestContext::of(&req);
        assert_eq!(cx.request_id().map(RequestId::as_str), Some("abc123"));
    }

    #[tokio::test]
    async fn test_extractor_defaults_to_empty() {
        let (mut parts, _) = Request::builder().body(Body::empty()).unwrap().into_parts();
        let cx = RequestContext::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(cx.request_id().is_none());
    }
}
