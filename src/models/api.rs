use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the process is serving
    pub status: String,
    /// Crate version
    pub version: String,
    /// Seconds since the application state was created
    pub uptime_seconds: u64,
}

/// Body of `POST /echo`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoRequest {
    pub message: String,
}

/// Reply of `POST /echo`.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    /// The message as received
    pub message: String,
    /// Correlation id of the request that carried it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Snapshot of the per-client rate limiter.
#[derive(Debug, Serialize)]
pub struct LimiterStatus {
    /// Whether rate limiting is configured at all
    pub enabled: bool,
    /// Number of client keys with a bucket
    pub keys: usize,
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl LimiterStatus {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            keys: 0,
            rate: 0.0,
            burst: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_deserialization() {
        let request: EchoRequest =
            serde_json::from_str(r#"{"message": "hi"}"#).expect("Deserialization should succeed");
        assert_eq!(request.message, "hi");
    }

    #[test]
    fn test_echo_request_rejects_unknown_fields() {
        let result = serde_json::from_str::<EchoRequest>(r#"{"message": "hi", "extra": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_echo_response_omits_missing_request_id() {
        let response = EchoResponse {
            message: "hi".to_string(),
            request_id: None,
        };
        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert_eq!(json, r#"{"message":"hi"}"#);
    }

    #[test]
    fn test_limiter_status_disabled() {
        let json = serde_json::to_value(LimiterStatus::disabled())
            .expect("Serialization should succeed");
        assert_eq!(json["enabled"], false);
        assert_eq!(json["keys"], 0);
    }
}
