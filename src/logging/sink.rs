//! Concrete log sinks.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};

use super::{Field, Level, LogRecord, LogSink, nest, qualify};
use crate::context::RequestContext;

/// `tracing` target used for per-request records.
pub const TRACING_TARGET: &str = "gatehouse::request";

/// Merge pre-bound fields with a record's own fields.
///
/// Bound keys were qualified when they were bound; record keys are qualified
/// with the sink's current group prefix.
fn render(prefix: &str, bound: &[(String, Value)], fields: Vec<Field>) -> Map<String, Value> {
    let mut map = Map::with_capacity(bound.len() + fields.len());
    for (key, value) in bound {
        map.insert(key.clone(), value.clone());
    }
    for field in fields {
        map.insert(qualify(prefix, &field.key), field.value);
    }
    map
}

fn bind(prefix: &str, bound: &[(String, Value)], fields: Vec<Field>) -> Vec<(String, Value)> {
    let mut out = bound.to_vec();
    out.extend(
        fields
            .into_iter()
            .map(|field| (qualify(prefix, &field.key), field.value)),
    );
    out
}

// =============================================================================
// TracingSink
// =============================================================================

/// Record keys with a fixed `tracing` field, plus everything else.
#[derive(Debug, Default)]
struct KnownFields {
    method: Option<String>,
    url: Option<String>,
    status: Option<u64>,
    bytes: Option<u64>,
    duration_seconds: Option<f64>,
    ip: Option<String>,
    request_id: Option<String>,
    err: Option<String>,
    /// Remaining keys as a JSON object, `None` when there are none.
    rest: Option<String>,
}

impl KnownFields {
    fn split(mut map: Map<String, Value>) -> Self {
        let mut known = Self {
            method: take_text(&mut map, "method"),
            url: take_text(&mut map, "url"),
            status: take_u64(&mut map, "status"),
            bytes: take_u64(&mut map, "bytes"),
            duration_seconds: take_f64(&mut map, "duration_seconds"),
            ip: take_text(&mut map, "ip"),
            request_id: take_text(&mut map, "request_id"),
            err: take_text(&mut map, "err"),
            rest: None,
        };
        if !map.is_empty() {
            known.rest = Some(Value::Object(map).to_string());
        }
        known
    }
}

/// Strings are taken as-is, other values in their JSON form.
fn take_text(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Only taken when numeric, otherwise left for the `fields` blob.
fn take_u64(map: &mut Map<String, Value>, key: &str) -> Option<u64> {
    let n = map.get(key)?.as_u64()?;
    map.remove(key);
    Some(n)
}

fn take_f64(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
    let n = map.get(key)?.as_f64()?;
    map.remove(key);
    Some(n)
}

/// `None` fields are skipped by subscribers, so absent keys stay absent.
macro_rules! emit_event {
    ($level:ident, $f:expr, $message:expr) => {
        tracing::$level!(
            target: TRACING_TARGET,
            method = $f.method.as_deref(),
            url = $f.url.as_deref(),
            status = $f.status,
            bytes = $f.bytes,
            duration_seconds = $f.duration_seconds,
            ip = $f.ip.as_deref(),
            request_id = $f.request_id.as_deref(),
            err = $f.err.as_deref(),
            fields = $f.rest.as_deref(),
            "{}",
            $message
        )
    };
}

/// Sink that forwards records to `tracing` events.
///
/// Each record becomes one event at the record's level with target
/// [`TRACING_TARGET`]. The per-request keys (`method`, `url`, `status`,
/// `bytes`, `duration_seconds`, `ip`, `request_id`, `err`) are recorded as
/// real `tracing` fields. `tracing` field names must be known at compile
/// time, so any other key lands in one JSON object in the `fields` field.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    prefix: String,
    bound: Vec<(String, Value)>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for TracingSink {
    fn enabled(&self, _cx: &RequestContext, level: Level) -> bool {
        match level {
            Level::ERROR => tracing::enabled!(target: TRACING_TARGET, Level::ERROR),
            Level::WARN => tracing::enabled!(target: TRACING_TARGET, Level::WARN),
            Level::INFO => tracing::enabled!(target: TRACING_TARGET, Level::INFO),
            Level::DEBUG => tracing::enabled!(target: TRACING_TARGET, Level::DEBUG),
            Level::TRACE => tracing::enabled!(target: TRACING_TARGET, Level::TRACE),
        }
    }

    fn emit(&self, _cx: &RequestContext, record: LogRecord) {
        let f = KnownFields::split(render(&self.prefix, &self.bound, record.fields));
        let message = record.message;

        match record.level {
            Level::ERROR => emit_event!(error, f, message),
            Level::WARN => emit_event!(warn, f, message),
            Level::INFO => emit_event!(info, f, message),
            Level::DEBUG => emit_event!(debug, f, message),
            Level::TRACE => emit_event!(trace, f, message),
        }
    }

    fn with_fields(&self, fields: Vec<Field>) -> Arc<dyn LogSink> {
        Arc::new(Self {
            prefix: self.prefix.clone(),
            bound: bind(&self.prefix, &self.bound, fields),
        })
    }

    fn with_group(&self, name: &str) -> Arc<dyn LogSink> {
        Arc::new(Self {
            prefix: nest(&self.prefix, name),
            bound: self.bound.clone(),
        })
    }
}

// =============================================================================
// CaptureSink
// =============================================================================

/// A record as stored by [`CaptureSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRecord {
    pub level: Level,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl CapturedRecord {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// In-memory sink that keeps every accepted record.
///
/// Clones and derived sinks share one buffer, so a test can hand a clone to
/// the pipeline and inspect what it logged afterwards.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    records: Arc<Mutex<Vec<CapturedRecord>>>,
    min_level: Level,
    prefix: String,
    bound: Vec<(String, Value)>,
}

impl CaptureSink {
    /// Capture every level.
    pub fn new() -> Self {
        Self::with_min_level(Level::TRACE)
    }

    /// Capture records at `min_level` or more severe.
    pub fn with_min_level(min_level: Level) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            min_level,
            prefix: String::new(),
            bound: Vec::new(),
        }
    }

    /// Snapshot of the captured records, oldest first.
    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured records with the given message.
    pub fn records_with_message(&self, message: &str) -> Vec<CapturedRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.message == message)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for CaptureSink {
    fn enabled(&self, _cx: &RequestContext, level: Level) -> bool {
        // More verbose levels compare greater in `tracing`.
        level <= self.min_level
    }

    fn emit(&self, _cx: &RequestContext, record: LogRecord) {
        let captured = CapturedRecord {
            level: record.level,
            message: record.message.into_owned(),
            fields: render(&self.prefix, &self.bound, record.fields),
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(captured);
    }

    fn with_fields(&self, fields: Vec<Field>) -> Arc<dyn LogSink> {
        Arc::new(Self {
            records: self.records.clone(),
            min_level: self.min_level,
            prefix: self.prefix.clone(),
            bound: bind(&self.prefix, &self.bound, fields),
        })
    }

    fn with_group(&self, name: &str) -> Arc<dyn LogSink> {
        Arc::new(Self {
            records: self.records.clone(),
            min_level: self.min_level,
            prefix: nest(&self.prefix, name),
            bound: self.bound.clone(),
        })
    }
}
