//! # Engine Events
//!
//! The engine reports logs, query timings, tracing spans and panics on an
//! out-of-band stream: stdout/stderr lines for the binary transport, a log
//! callback for the native library. [`log_line`] classifies those lines;
//! [`EventPublisher`] fans the resulting [`EngineEvent`]s out to subscribers.

pub mod log_line;
pub mod publisher;

pub use log_line::{classify_line, keep_first_error, LogLine, RustError, RustLog};
pub use publisher::EventPublisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an engine event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventLevel {
    Query,
    Info,
    Warn,
    Error,
}

/// Timing of a single executed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub query: String,
    pub params: String,
    pub duration_ms: u64,
}

/// Event emitted by an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub level: EngineEventLevel,
    pub message: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryEvent>,
}

impl EngineEvent {
    pub fn new(level: EngineEventLevel, message: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            target: target.into(),
            timestamp: Utc::now(),
            query: None,
        }
    }
}

/// Destination for tracing spans reported by the engine
pub trait SpanExporter: Send + Sync {
    fn export(&self, spans: Vec<Value>);
}

/// Exporter that records engine spans as `tracing` debug records
#[derive(Debug, Default)]
pub struct TracingSpanExporter;

impl SpanExporter for TracingSpanExporter {
    fn export(&self, spans: Vec<Value>) {
        for span in spans {
            tracing::debug!(span_name = span_name(&span), span = %span, "engine span");
        }
    }
}

fn span_name(span: &Value) -> &str {
    span.get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
}

/// Forward an engine event into the host's own `tracing` output
pub(crate) fn trace_event(engine_id: &str, event: &EngineEvent) {
    match event.level {
        EngineEventLevel::Error => {
            tracing::error!(engine_id = %engine_id, target_module = %event.target, "{}", event.message)
        }
        EngineEventLevel::Warn => {
            tracing::warn!(engine_id = %engine_id, target_module = %event.target, "{}", event.message)
        }
        EngineEventLevel::Info => {
            tracing::debug!(engine_id = %engine_id, target_module = %event.target, "{}", event.message)
        }
        EngineEventLevel::Query => {
            if let Some(query) = &event.query {
                tracing::debug!(
                    engine_id = %engine_id,
                    duration_ms = query.duration_ms,
                    params = %query.params,
                    "{}",
                    query.query
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_span_name_falls_back_to_unknown() {
        assert_eq!(span_name(&json!({"name": "prisma:engine:query"})), "prisma:engine:query");
        assert_eq!(span_name(&json!({"name": 7})), "unknown");
        assert_eq!(span_name(&json!({})), "unknown");
    }

    #[test]
    fn test_tracing_exporter_accepts_unnamed_spans() {
        TracingSpanExporter.export(vec![json!({"name": "db_query"}), json!({"id": "1"})]);
    }
}
