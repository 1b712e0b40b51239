//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `ADMIN_API_KEY`: Shared secret for `/admin/*` routes (unset = admin routes disabled)
//! - `CORS_ALLOW_CREDENTIALS`: Send `Access-Control-Allow-Credentials: true` (default: false)
//! - `LOG_ANONYMIZE_IP`: Coarsen caller addresses in request logs (default: false)
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_RPS`: Tokens per second per client (default: 10, 0 = disabled)
//! - `RATE_LIMIT_BURST`: Bucket capacity per client (default: 20)
//! - `RATE_LIMIT_IDLE_EVICT_SECS`: Drop idle client buckets after this long (default: 0 = never)
//!
//! # Server Timeouts
//!
//! - `READ_TIMEOUT_SECS` (20), `WRITE_TIMEOUT_SECS` (120), `IDLE_TIMEOUT_SECS` (120)
//! - `SHUTDOWN_GRACE_SECS`: How long in-flight requests may run after shutdown begins (10)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ServerError;
use crate::server::ServerOptions;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("expected `json` or `pretty`, got `{other}`")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum time to read a request body (default: 20 seconds)
    pub read_timeout: Duration,

    /// Maximum time to produce a response (default: 120 seconds)
    pub write_timeout: Duration,

    /// Keep-alive idle time (default: 120 seconds)
    pub idle_timeout: Duration,

    /// Drain period for in-flight requests on shutdown (default: 10 seconds)
    pub shutdown_grace: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Tokens per second per client (default: 10)
    /// Set to 0 to disable rate limiting
    pub rate_limit_rps: f64,

    /// Burst capacity per client (default: 20)
    pub rate_limit_burst: u32,

    /// Evict client buckets idle for this long (default: 0 = never evict)
    pub rate_limit_idle_evict: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Shared secret for admin routes (optional - admin routes are not
    /// mounted without it). Pass via the `X-Api-Key` header.
    pub admin_api_key: Option<String>,

    /// Send `Access-Control-Allow-Credentials: true` (default: false)
    pub cors_allow_credentials: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level filter used when `RUST_LOG` is unset (default: "info")
    pub log_level: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Anonymize caller addresses in request logs (default: false)
    pub log_anonymize_ip: bool,

    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if any value cannot be parsed or fails
    /// validation.
    pub fn from_env() -> Result<Self, ServerError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            read_timeout: Duration::from_secs(Self::parse_env("READ_TIMEOUT_SECS", 20)?),
            write_timeout: Duration::from_secs(Self::parse_env("WRITE_TIMEOUT_SECS", 120)?),
            idle_timeout: Duration::from_secs(Self::parse_env("IDLE_TIMEOUT_SECS", 120)?),
            shutdown_grace: Duration::from_secs(Self::parse_env("SHUTDOWN_GRACE_SECS", 10)?),

            // Rate limiting
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 10.0)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 20)?,
            rate_limit_idle_evict: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_IDLE_EVICT_SECS",
                0,
            )?),

            // Security
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            cors_allow_credentials: Self::parse_env("CORS_ALLOW_CREDENTIALS", false)?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            log_anonymize_ip: Self::parse_env("LOG_ANONYMIZE_IP", false)?,
            metrics_port: Self::parse_env("METRICS_PORT", 0)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if validation fails.
    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps < 0.0 {
            return Err(ServerError::Config(format!(
                "RATE_LIMIT_RPS must be a non-negative number, got {}",
                self.rate_limit_rps
            )));
        }

        if self.rate_limiting_enabled() && self.rate_limit_burst == 0 {
            return Err(ServerError::Config(
                "RATE_LIMIT_BURST must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.write_timeout.is_zero() {
            return Err(ServerError::Config(
                "WRITE_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.read_timeout.is_zero() {
            return Err(ServerError::Config(
                "READ_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_rps > 0.0
    }

    /// Check if idle limiter eviction is enabled.
    pub fn idle_eviction_enabled(&self) -> bool {
        !self.rate_limit_idle_evict.is_zero()
    }

    /// Check if the admin routes are enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Timeouts and CORS settings for the server lifecycle manager.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            shutdown_grace: self.shutdown_grace,
            cors_allow_credentials: self.cors_allow_credentials,
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> Result<T, ServerError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| ServerError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("rate_limit_idle_evict", &self.rate_limit_idle_evict)
            .field(
                "admin_api_key",
                &self.admin_api_key.as_ref().map(|_| "[redacted]"),
            )
            .field("cors_allow_credentials", &self.cors_allow_credentials)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("log_anonymize_ip", &self.log_anonymize_ip)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
            // Rate limiting
            rate_limit_rps: 10.0,
            rate_limit_burst: 20,
            rate_limit_idle_evict: Duration::ZERO,
            // Security
            admin_api_key: None,
            cors_allow_credentials: false,
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_anonymize_ip: false,
            metrics_port: 0,
        }
    }
}
