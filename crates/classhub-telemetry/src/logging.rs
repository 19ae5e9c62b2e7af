use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CREATE_LOGS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    unit_id TEXT,
    client_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_unit ON logs(unit_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

/// SQLite sink for WARN and ERROR events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &Entry) {
        let conn = self.conn.lock();
        // A failing log write must never surface to the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, unit_id, client_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.unit_id,
                entry.client_id,
            ],
        );
    }
}

struct Entry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    unit_id: Option<String>,
    client_id: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Collects event or span fields, pulling out the correlation ids.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    unit_id: Option<String>,
    client_id: Option<String>,
}

impl FieldVisitor {
    fn capture(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => self.message = Some(plain(value)),
            "unit_id" => self.unit_id = Some(plain(value)),
            "client_id" => self.client_id = Some(plain(value)),
            name => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

fn plain(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.capture(field, Value::String(text.trim_matches('"').to_string()));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.capture(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.capture(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.capture(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.capture(field, Value::Bool(value));
    }
}

/// Correlation ids recorded on a span, inherited by events inside it.
struct SpanIds {
    unit_id: Option<String>,
    client_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.unit_id.is_none() && visitor.client_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                unit_id: visitor.unit_id,
                client_id: visitor.client_id,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.unit_id.is_some() && visitor.client_id.is_some() {
                    break;
                }
                if let Some(ids) = span.extensions().get::<SpanIds>() {
                    if visitor.unit_id.is_none() {
                        visitor.unit_id.clone_from(&ids.unit_id);
                    }
                    if visitor.client_id.is_none() {
                        visitor.client_id.clone_from(&ids.client_id);
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&Entry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            unit_id: visitor.unit_id,
            client_id: visitor.client_id,
        });
    }
}
