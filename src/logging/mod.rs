//! Structured per-request logging.
//!
//! # Sinks
//!
//! A [`LogSink`] is anything that can receive structured records. It exposes
//! four capabilities:
//!
//! - `enabled` - would a record at this level be kept?
//! - `emit` - accept one record
//! - `with_fields` - derive a sink that adds fixed fields to every record
//! - `with_group` - derive a sink that qualifies field keys with a group name
//!
//! Every operation receives the active [`RequestContext`], which is how the
//! [`RequestIdSink`] decorator attaches the correlation identifier without
//! call sites mentioning it.
//!
//! # Provided sinks
//!
//! | Sink | Purpose |
//! |------|---------|
//! | [`TracingSink`] | Forwards records to `tracing` events (production) |
//! | [`CaptureSink`] | Keeps records in memory (tests, diagnostics) |
//! | [`RequestIdSink`] | Adds `request_id` from the context, delegates everything else |
//!
//! # Process-level logging
//!
//! Startup, shutdown and background-task diagnostics do not belong to any
//! request; they use the `tracing` macros directly. [`init_subscriber`]
//! installs the global `tracing-subscriber` used by both paths.

mod enrich;
mod sink;

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::context::RequestContext;

pub use enrich::{REQUEST_ID_FIELD, RequestIdSink};
pub use sink::{CaptureSink, CapturedRecord, TracingSink};
pub use tracing::Level;

/// One key/value pair attached to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: Cow<'static, str>,
    pub value: Value,
}

impl Field {
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A structured log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub message: Cow<'static, str>,
    pub fields: Vec<Field>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field (builder style).
    pub fn with(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Self {
        self.fields.push(Field::new(key, value));
        self
    }

    /// Append a field in place.
    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }
}

/// Capability set of a structured log sink.
pub trait LogSink: Send + Sync {
    /// Whether a record at `level` would be kept.
    fn enabled(&self, cx: &RequestContext, level: Level) -> bool;

    /// Accept one record.
    fn emit(&self, cx: &RequestContext, record: LogRecord);

    /// Derive a sink that attaches `fields` to every record.
    fn with_fields(&self, fields: Vec<Field>) -> Arc<dyn LogSink>;

    /// Derive a sink that qualifies subsequent field keys with `name`.
    fn with_group(&self, name: &str) -> Arc<dyn LogSink>;
}

/// Cloneable handle to a shared sink.
///
/// Middleware receives a `Logger` at construction time; it is the only way
/// per-request records leave the pipeline.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(sink: impl LogSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn from_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Production logger: `tracing` output enriched with the request id.
    pub fn tracing() -> Self {
        Self::new(RequestIdSink::wrap(TracingSink::new()))
    }

    pub fn enabled(&self, cx: &RequestContext, level: Level) -> bool {
        self.sink.enabled(cx, level)
    }

    /// Emit `record` if its level is enabled.
    pub fn log(&self, cx: &RequestContext, record: LogRecord) {
        if self.sink.enabled(cx, record.level) {
            self.sink.emit(cx, record);
        }
    }

    pub fn info(&self, cx: &RequestContext, message: impl Into<Cow<'static, str>>, fields: Vec<Field>) {
        self.log(
            cx,
            LogRecord {
                level: Level::INFO,
                message: message.into(),
                fields,
            },
        );
    }

    pub fn warn(&self, cx: &RequestContext, message: impl Into<Cow<'static, str>>, fields: Vec<Field>) {
        self.log(
            cx,
            LogRecord {
                level: Level::WARN,
                message: message.into(),
                fields,
            },
        );
    }

    pub fn with_fields(&self, fields: Vec<Field>) -> Self {
        Self {
            sink: self.sink.with_fields(fields),
        }
    }

    pub fn with_group(&self, name: &str) -> Self {
        Self {
            sink: self.sink.with_group(name),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `config.log_level`. Output is JSON or human-readable per `config.log_format`.
pub fn init_subscriber(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
    }
}

/// Qualify `key` with a group prefix such as `"db.pool."`.
fn qualify(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{key}")
    }
}

/// Extend a group prefix with `name`. Empty names leave the prefix unchanged.
fn nest(prefix: &str, name: &str) -> String {
    if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}{name}.")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::RequestId;

    #[test]
    fn test_logger_skips_disabled_levels() {
        let capture = CaptureSink::with_min_level(Level::WARN);
        let logger = Logger::new(capture.clone());
        let cx = RequestContext::empty();

        logger.info(&cx, "dropped", vec![]);
        logger.warn(&cx, "kept", vec![]);

        let records = capture.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "kept");
    }

    #[test]
    fn test_logger_derivations_share_buffer() {
        let capture = CaptureSink::new();
        let logger = Logger::new(capture.clone())
            .with_fields(vec![Field::new("component", "limiter")])
            .with_group("http");
        let cx = RequestContext::new(RequestId::from("r1"));

        logger.info(&cx, "hello", vec![Field::new("status", 200)]);

        let records = capture.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("component"), Some(&Value::from("limiter")));
        assert_eq!(records[0].field("http.status"), Some(&Value::from(200)));
    }

    #[test]
    fn test_record_builder() {
        let record = LogRecord::new(Level::INFO, "msg").with("a", 1).with("b", "two");
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.fields[1], Field::new("b", "two"));
    }

    #[test]
    fn test_nest_and_qualify() {
        assert_eq!(qualify("", "k"), "k");
        assert_eq!(qualify("g.", "k"), "g.k");
        assert_eq!(nest("", "g"), "g.");
        assert_eq!(nest("g.", "h"), "g.h.");
        assert_eq!(nest("g.", ""), "g.");
    }
}
