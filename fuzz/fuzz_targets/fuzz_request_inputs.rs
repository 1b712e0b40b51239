//! Fuzz testing for the parsers that see raw client input.
//!
//! Caller addresses arrive in the `X-Envoy-External-Address` header and
//! media types in `Content-Type`; both are attacker-controlled. This target
//! checks that:
//!
//! - `anonymize` never panics and passes input it cannot parse through
//! - `require_json_content_type` never panics on any header value
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the target
//! cargo +nightly fuzz run fuzz_request_inputs
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_request_inputs -- -max_total_time=60
//! ```

#![no_main]

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use gatehouse::json::require_json_content_type;
use gatehouse::logging::{CaptureSink, Logger};
use gatehouse::middleware::anonymize;
use gatehouse::RequestContext;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let capture = CaptureSink::new();
        let logger = Logger::new(capture.clone());
        let out = anonymize(&logger, &RequestContext::empty(), s);

        // A parse failure is logged and the input passes through, minus
        // any surrounding brackets.
        if !capture.is_empty() {
            assert!(s.contains(out.as_str()));
        }
    }

    // Header values may hold arbitrary visible bytes, not only UTF-8.
    if let Ok(value) = HeaderValue::from_bytes(data) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, value);
        let _ = require_json_content_type(&headers);
    }
});
