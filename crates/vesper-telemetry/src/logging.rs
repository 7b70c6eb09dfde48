use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A captured warn+ event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub topic: Option<String>,
    pub tab_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub topic: Option<String>,
    pub limit: Option<usize>,
}

/// Bounded in-memory buffer of recent warnings and errors.
pub struct WarningLog {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl WarningLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent first.
    pub fn query(&self, q: &LogQuery) -> Vec<LogRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| q.level.as_ref().map_or(true, |l| r.level.eq_ignore_ascii_case(l)))
            .filter(|r| q.target.as_ref().map_or(true, |t| r.target.contains(t.as_str())))
            .filter(|r| q.topic.is_none() || r.topic == q.topic)
            .take(q.limit.unwrap_or(100))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// tracing Layer that captures warn+ events into a [`WarningLog`].
pub struct WarningLogLayer {
    sink: Arc<WarningLog>,
}

impl WarningLogLayer {
    pub fn new(sink: Arc<WarningLog>) -> Self {
        Self { sink }
    }
}

struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    topic: Option<String>,
    tab_id: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            topic: None,
            tab_id: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(val),
            "topic" => self.topic = Some(val.trim_matches('"').to_string()),
            "tab_id" => self.tab_id = Some(val.trim_matches('"').to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "topic" => self.topic = Some(value.to_string()),
            "tab_id" => self.tab_id = Some(value.to_string()),
            name => {
                self.fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit `topic` / `tab_id`.
struct SpanFields {
    topic: Option<String>,
    tab_id: Option<String>,
}

impl<S> Layer<S> for WarningLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        if visitor.topic.is_none() || visitor.tab_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.topic.is_none() {
                            visitor.topic.clone_from(&fields.topic);
                        }
                        if visitor.tab_id.is_none() {
                            visitor.tab_id.clone_from(&fields.tab_id);
                        }
                    }
                }
            }
        }

        self.sink.push(LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            topic: visitor.topic,
            tab_id: visitor.tab_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.topic.is_some() || visitor.tab_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    topic: visitor.topic,
                    tab_id: visitor.tab_id,
                });
            }
        }
    }
}
