mod api;

pub use api::{EchoRequest, EchoResponse, HealthResponse, LimiterStatus};
