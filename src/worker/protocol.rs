//! Messages exchanged between the worker proxy and the worker thread.
//!
//! Requests are `{id, action, data}`. Replies carry the request id and either
//! `data` or `error`; notifications have no id and carry `{event, data}`.
//! Errors cross the boundary as plain [`WireError`] data and are rebuilt into
//! [`EngineError`] on the caller side.

use crate::error::{EngineError, NetworkErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Notification carrying an [`EngineEvent`](crate::events::EngineEvent)
pub const ENGINE_EVENT: &str = "engine_event";
/// Notification carrying the engine state after a call
pub const STATE_CHANGED: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    Start,
    Stop,
    Request,
    RequestBatch,
    Transaction,
    Metrics,
    Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: String,
    pub action: WorkerAction,
    #[serde(default)]
    pub data: Value,
}

/// Anything the worker sends back. Variant order matters for untagged decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Failure { id: String, error: WireError },
    Reply { id: String, data: Value },
    Notification { event: String, data: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    Initialization,
    RustPanic,
    KnownRequest,
    UnknownRequest,
    Network,
    EngineStuck,
    NotConnected,
    WorkerExited,
    InvalidTransition,
    Configuration,
    #[serde(other)]
    Unrecognized,
}

/// Error flattened to a kind plus its own fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl From<&EngineError> for WireError {
    fn from(error: &EngineError) -> Self {
        let message = error.to_string();
        let (kind, fields) = match error {
            EngineError::Initialization {
                client_version,
                error_code,
                ..
            } => (
                WireErrorKind::Initialization,
                fields(json!({ "client_version": client_version, "error_code": error_code })),
            ),
            EngineError::RustPanic { client_version, .. } => (
                WireErrorKind::RustPanic,
                fields(json!({ "client_version": client_version })),
            ),
            EngineError::KnownRequest {
                code,
                meta,
                client_version,
                ..
            } => (
                WireErrorKind::KnownRequest,
                fields(json!({ "code": code, "meta": meta, "client_version": client_version })),
            ),
            EngineError::UnknownRequest { client_version, .. } => (
                WireErrorKind::UnknownRequest,
                fields(json!({ "client_version": client_version })),
            ),
            EngineError::Network { code, message } => (
                WireErrorKind::Network,
                fields(json!({ "code": code, "message": message })),
            ),
            EngineError::EngineStuck => (WireErrorKind::EngineStuck, Map::new()),
            EngineError::NotConnected => (WireErrorKind::NotConnected, Map::new()),
            EngineError::WorkerExited { reason } => (
                WireErrorKind::WorkerExited,
                fields(json!({ "reason": reason })),
            ),
            EngineError::InvalidTransition { from, event } => (
                WireErrorKind::InvalidTransition,
                fields(json!({ "from": from, "event": event })),
            ),
            EngineError::Configuration(detail) => (
                WireErrorKind::Configuration,
                fields(json!({ "detail": detail })),
            ),
        };
        Self {
            kind,
            message,
            fields,
        }
    }
}

impl WireError {
    fn string_field(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(Value::as_str).map(str::to_string)
    }

    fn client_version(&self) -> String {
        self.string_field("client_version").unwrap_or_default()
    }

    /// Rebuild the typed error; unrecognized kinds become unknown request errors
    pub fn into_engine_error(self) -> EngineError {
        match self.kind {
            WireErrorKind::Initialization => EngineError::initialization_with_code(
                self.message.clone(),
                self.client_version(),
                self.string_field("error_code"),
            ),
            WireErrorKind::RustPanic => EngineError::RustPanic {
                client_version: self.client_version(),
                message: self.message,
            },
            WireErrorKind::KnownRequest => EngineError::known(
                self.message.clone(),
                self.string_field("code").unwrap_or_default(),
                self.fields.get("meta").filter(|meta| !meta.is_null()).cloned(),
                self.client_version(),
            ),
            WireErrorKind::UnknownRequest | WireErrorKind::Unrecognized => {
                EngineError::unknown(self.message.clone(), self.client_version())
            }
            WireErrorKind::Network => {
                let code = self
                    .fields
                    .get("code")
                    .cloned()
                    .and_then(|code| serde_json::from_value(code).ok())
                    .unwrap_or(NetworkErrorCode::Other);
                let message = self.string_field("message").unwrap_or(self.message);
                EngineError::network(code, message)
            }
            WireErrorKind::EngineStuck => EngineError::EngineStuck,
            WireErrorKind::NotConnected => EngineError::NotConnected,
            WireErrorKind::WorkerExited => EngineError::WorkerExited {
                reason: self.string_field("reason").unwrap_or(self.message),
            },
            WireErrorKind::InvalidTransition => EngineError::InvalidTransition {
                from: self.string_field("from").unwrap_or_default(),
                event: self.string_field("event").unwrap_or_default(),
            },
            WireErrorKind::Configuration => {
                EngineError::Configuration(self.string_field("detail").unwrap_or(self.message))
            }
        }
    }
}
