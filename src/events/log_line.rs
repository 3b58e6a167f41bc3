//! Classification of the engine's line-oriented log protocol.
//!
//! Each line is either a JSON document (structured log, span batch, error
//! report) or free text. Classification is pure; acting on the result is up to
//! the transport.

use super::{EngineEvent, EngineEventLevel, QueryEvent};
use crate::constants::markers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error reported by the engine on its log stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RustError {
    #[serde(default)]
    pub is_panic: bool,
    pub message: String,
    #[serde(default)]
    pub backtrace: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl RustError {
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            is_panic: true,
            message: message.into(),
            backtrace: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_panic: false,
            message: message.into(),
            backtrace: None,
            error_code: None,
        }
    }

    /// Message followed by the backtrace when one was reported
    pub fn full_message(&self) -> String {
        match &self.backtrace {
            Some(backtrace) if !backtrace.is_empty() => format!("{}\n{}", self.message, backtrace),
            _ => self.message.clone(),
        }
    }
}

/// Keep the first captured error; a panic replaces an earlier non-panic error
pub fn keep_first_error(slot: &mut Option<RustError>, error: RustError) {
    let replace = match slot.as_ref() {
        None => true,
        Some(existing) => !existing.is_panic && error.is_panic,
    };
    if replace {
        *slot = Some(error);
    }
}

/// Structured log record emitted by the engine
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RustLog {
    pub level: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub item_type: Option<String>,
}

impl RustLog {
    pub fn message(&self) -> &str {
        self.fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn field_str(&self, name: &str) -> String {
        match self.fields.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// The engine's startup handshake
    pub fn is_ready_marker(&self) -> bool {
        self.level == markers::READY_LEVEL
            && self.target == markers::READY_TARGET
            && self.message().starts_with(markers::READY_MESSAGE_PREFIX)
    }

    pub fn is_panic(&self) -> bool {
        self.level.eq_ignore_ascii_case("error") && self.message() == markers::PANIC_MESSAGE
    }

    /// Error-level records and anything mentioning a fatal error
    pub fn is_error_log(&self) -> bool {
        self.level.eq_ignore_ascii_case("error") || self.message().contains(markers::FATAL_ERROR)
    }

    pub fn is_query(&self) -> bool {
        self.item_type.as_deref() == Some("query") || self.fields.contains_key("query")
    }

    /// Panic record rendered as `message: reason in file:line:column`
    pub fn to_panic(&self) -> RustError {
        RustError::panic(format!(
            "{}: {} in {}:{}:{}",
            self.message(),
            self.field_str("reason"),
            self.field_str("file"),
            self.field_str("line"),
            self.field_str("column"),
        ))
    }

    pub fn to_error(&self) -> RustError {
        RustError::error(self.message().to_string())
    }

    pub fn to_event(&self) -> EngineEvent {
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        if self.is_query() {
            let duration_ms = self
                .fields
                .get("duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            let query = self.field_str("query");
            return EngineEvent {
                level: EngineEventLevel::Query,
                message: query.clone(),
                target: self.target.clone(),
                timestamp,
                query: Some(QueryEvent {
                    query,
                    params: self.field_str("params"),
                    duration_ms,
                }),
            };
        }

        let level = match self.level.to_ascii_lowercase().as_str() {
            "error" => EngineEventLevel::Error,
            "warn" => EngineEventLevel::Warn,
            _ => EngineEventLevel::Info,
        };

        EngineEvent {
            level,
            message: self.message().to_string(),
            target: self.target.clone(),
            timestamp,
            query: None,
        }
    }
}

/// Result of classifying one line of engine output
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    /// Error report; panics have `is_panic` set
    RustError(RustError),
    /// The engine is accepting requests
    Ready,
    /// Batch of tracing spans
    Spans(Vec<Value>),
    /// Any other structured record
    Log(RustLog),
    /// Free text kept for exit diagnostics
    Raw(String),
    /// Blank lines and known chatter
    Noise,
}

pub fn classify_line(line: &str) -> LogLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LogLine::Noise;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => return classify_text(trimmed),
    };

    if value.get("is_panic").is_some() {
        return match serde_json::from_value::<RustError>(value) {
            Ok(error) => LogLine::RustError(error),
            Err(_) => LogLine::Raw(trimmed.to_string()),
        };
    }

    if value.get("span").and_then(Value::as_bool) == Some(true) {
        let spans = match value.get("spans") {
            Some(Value::Array(spans)) => spans.clone(),
            _ => Vec::new(),
        };
        return LogLine::Spans(spans);
    }

    match serde_json::from_value::<RustLog>(value) {
        Ok(log) if log.is_ready_marker() => LogLine::Ready,
        Ok(log) if log.is_panic() => LogLine::RustError(log.to_panic()),
        Ok(log) => LogLine::Log(log),
        Err(_) => LogLine::Raw(trimmed.to_string()),
    }
}

fn classify_text(line: &str) -> LogLine {
    if markers::NOISE.iter().any(|noise| line.contains(noise)) {
        LogLine::Noise
    } else {
        LogLine::Raw(line.to_string())
    }
}
