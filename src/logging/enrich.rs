//! Correlation-id enrichment for log sinks.

use std::sync::Arc;

use super::{Field, Level, LogRecord, LogSink};
use crate::context::RequestContext;

/// Field name under which the correlation identifier is recorded.
pub const REQUEST_ID_FIELD: &str = "request_id";

/// Delegating sink that adds `request_id` to every emitted record.
///
/// The identifier is read from the [`RequestContext`] handed to `emit`, so
/// call sites never reference it. Every other operation is forwarded to the
/// wrapped sink unchanged, and derived sinks stay wrapped. With an empty
/// context the wrapper adds nothing.
#[derive(Clone)]
pub struct RequestIdSink {
    inner: Arc<dyn LogSink>,
}

impl RequestIdSink {
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self { inner }
    }

    pub fn wrap(inner: impl LogSink + 'static) -> Self {
        Self::new(Arc::new(inner))
    }
}

impl LogSink for RequestIdSink {
    fn enabled(&self, cx: &RequestContext, level: Level) -> bool {
        self.inner.enabled(cx, level)
    }

    fn emit(&self, cx: &RequestContext, mut record: LogRecord) {
        if let Some(id) = cx.request_id() {
            record.add(Field::new(REQUEST_ID_FIELD, id.as_str()));
        }
        self.inner.emit(cx, record);
    }

    fn with_fields(&self, fields: Vec<Field>) -> Arc<dyn LogSink> {
        Arc::new(Self::new(self.inner.with_fields(fields)))
    }

    fn with_group(&self, name: &str) -> Arc<dyn LogSink> {
        Arc::new(Self::new(self.inner.with_group(name)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::context::RequestId;
    use crate::logging::CaptureSink;

    fn cx(id: &str) -> RequestContext {
        RequestContext::new(RequestId::from(id))
    }

    #[test]
    fn test_injects_request_id() {
        let capture = CaptureSink::new();
        let sink = RequestIdSink::wrap(capture.clone());

        sink.emit(&cx("abc123"), LogRecord::new(Level::INFO, "hello"));

        let records = capture.records();
        assert_eq!(records[0].field(REQUEST_ID_FIELD), Some(&Value::from("abc123")));
    }

    #[test]
    fn test_pass_through_without_request_id() {
        let capture = CaptureSink::new();
        let sink = RequestIdSink::wrap(capture.clone());

        let record = LogRecord::new(Level::INFO, "hello").with("k", "v");
        sink.emit(&RequestContext::empty(), record);

        let records = capture.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].field(REQUEST_ID_FIELD).is_none());
        assert_eq!(records[0].fields.len(), 1);
    }

    #[test]
    fn test_enabled_is_forwarded() {
        let sink = RequestIdSink::wrap(CaptureSink::with_min_level(Level::WARN));
        let cx = RequestContext::empty();

        assert!(sink.enabled(&cx, Level::ERROR));
        assert!(sink.enabled(&cx, Level::WARN));
        assert!(!sink.enabled(&cx, Level::INFO));
    }

    #[test]
    fn test_derived_sinks_stay_enriched() {
        let capture = CaptureSink::new();
        let sink = RequestIdSink::wrap(capture.clone());

        let derived = sink
            .with_fields(vec![Field::new("svc", "api")])
            .with_group("req");
        derived.emit(&cx("zz9zz9"), LogRecord::new(Level::INFO, "m").with("status", 200));

        let records = capture.records();
        let record = &records[0];
        assert_eq!(record.field("svc"), Some(&Value::from("api")));
        assert_eq!(record.field("req.status"), Some(&Value::from(200)));
        // Added at emission time, so it is qualified like any record field.
        assert_eq!(record.field("req.request_id"), Some(&Value::from("zz9zz9")));
    }

    #[test]
    fn test_each_context_sees_only_its_own_id() {
        let capture = CaptureSink::new();
        let sink = RequestIdSink::wrap(capture.clone());

        sink.emit(&cx("aaaaaa"), LogRecord::new(Level::INFO, "one"));
        sink.emit(&cx("bbbbbb"), LogRecord::new(Level::INFO, "two"));

        let records = capture.records();
        assert_eq!(records[0].field(REQUEST_ID_FIELD), Some(&Value::from("aaaaaa")));
        assert_eq!(records[1].field(REQUEST_ID_FIELD), Some(&Value::from("bbbbbb")));
    }
}
