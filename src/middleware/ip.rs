//! Caller address extraction and anonymization.
//!
//! # Security Warning: Address Spoofing
//!
//! [`client_ip`] trusts the `X-Envoy-External-Address` header whenever it is
//! present. This is only safe when the service sits behind an Envoy edge proxy
//! that overwrites the header. A directly reachable service lets clients pick
//! their own rate-limit key by setting the header themselves.
//!
//! # The empty fallback
//!
//! When neither the header nor the socket peer address is available the
//! caller address is the empty string. All such requests share one rate-limit
//! bucket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;

use crate::context::RequestContext;
use crate::logging::{Field, Logger};

/// Header set by Envoy to the original client address.
pub const EXTERNAL_ADDRESS_HEADER: &str = "x-envoy-external-address";

/// Best-effort caller address for `req`.
///
/// Checks in order (returns first match):
/// 1. A non-empty `X-Envoy-External-Address` header
/// 2. The socket peer address from [`ConnectInfo`], without the port
/// 3. The empty string
#[inline]
pub fn client_ip<B>(req: &Request<B>) -> String {
    if let Some(value) = req.headers().get(EXTERNAL_ADDRESS_HEADER)
        && let Ok(value) = value.to_str()
        && !value.is_empty()
    {
        return value.to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

/// Coarsen a caller address before it is logged.
///
/// - Surrounding brackets (`[::1]`) are stripped
/// - Private and loopback addresses are returned unchanged
/// - Public IPv4 addresses keep their first two octets (`86.76.0.0`)
/// - Public IPv6 addresses keep their first four hextets (`2001:db8:1:2::`)
/// - Unparsable input is logged as a warning and returned unchanged
pub fn anonymize(logger: &Logger, cx: &RequestContext, ip: &str) -> String {
    // Only a bracketed address loses its brackets; a bare "[]" stays as is.
    let ip = match ip.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        Some(inner) if !inner.is_empty() => inner,
        _ => ip,
    };

    let parsed: IpAddr = match ip.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            logger.warn(
                cx,
                "failed to parse ip",
                vec![Field::new("err", e.to_string()), Field::new("ip", ip.to_string())],
            );
            return ip.to_string();
        }
    };

    match parsed {
        IpAddr::V4(v4) if v4.is_private() || v4.is_loopback() => ip.to_string(),
        IpAddr::V6(v6) if v6.is_unique_local() || v6.is_loopback() => ip.to_string(),
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            Ipv4Addr::new(a, b, 0, 0).to_string()
        }
        IpAddr::V6(v6) => {
            let [a, b, c, d, ..] = v6.segments();
            Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0).to_string()
        }
    }
}

/// How caller addresses are rendered in log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpFormatter {
    #[default]
    Raw,
    Anonymized,
}

impl IpFormatter {
    pub fn from_flag(anonymize: bool) -> Self {
        if anonymize { Self::Anonymized } else { Self::Raw }
    }

    pub fn format(self, logger: &Logger, cx: &RequestContext, ip: &str) -> String {
        match self {
            Self::Raw => ip.to_string(),
            Self::Anonymized => anonymize(logger, cx, ip),
        }
    }
}
