//! Interactive transaction sub-protocol.
//!
//! A transaction is started with [`TransactionRequest::Start`], which yields a
//! [`TransactionInfo`]; the same info is later consumed by exactly one commit
//! or rollback. Transaction calls are never retried.

use crate::constants::{http, DEFAULT_TRANSACTION_MAX_WAIT_MS, DEFAULT_TRANSACTION_TIMEOUT_MS};
use crate::engine::protocol::ErrorContext;
use crate::engine::RequestHeaders;
use crate::error::{EngineError, EngineResult};
use crate::library::NativeMethod;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "ReadUncommitted",
            Self::ReadCommitted => "ReadCommitted",
            Self::RepeatableRead => "RepeatableRead",
            Self::Snapshot => "Snapshot",
            Self::Serializable => "Serializable",
        };
        f.write_str(name)
    }
}

/// Options for starting a transaction; durations in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub max_wait: u64,
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<IsolationLevel>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_TRANSACTION_MAX_WAIT_MS,
            timeout: DEFAULT_TRANSACTION_TIMEOUT_MS,
            isolation_level: None,
        }
    }
}

/// Handle of an open transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    /// Full response of the start call
    #[serde(default)]
    pub payload: Value,
}

impl TransactionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum TransactionRequest {
    Start(TransactionOptions),
    Commit(TransactionInfo),
    Rollback(TransactionInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Started(TransactionInfo),
    Committed,
    RolledBack,
}

impl TransactionRequest {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Commit(_) => "commit",
            Self::Rollback(_) => "rollback",
        }
    }

    /// HTTP path on the engine endpoint
    pub fn http_path(&self) -> String {
        match self {
            Self::Start(_) => http::TRANSACTION_START_PATH.to_string(),
            Self::Commit(info) => format!("/transaction/{}/commit", info.id),
            Self::Rollback(info) => format!("/transaction/{}/rollback", info.id),
        }
    }

    /// Method on the native library
    pub fn native_method(&self) -> NativeMethod {
        match self {
            Self::Start(_) => NativeMethod::StartTransaction,
            Self::Commit(_) => NativeMethod::CommitTransaction,
            Self::Rollback(_) => NativeMethod::RollbackTransaction,
        }
    }

    /// Arguments of the native call
    pub fn native_args(&self, headers: &RequestHeaders) -> Value {
        match self {
            Self::Start(options) => json!({ "options": options, "headers": headers }),
            Self::Commit(info) | Self::Rollback(info) => {
                json!({ "txId": info.id, "headers": headers })
            }
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Self::Start(options) => json!(options),
            Self::Commit(_) | Self::Rollback(_) => json!({}),
        }
    }

    /// Turn a successful engine reply into an outcome; an `error_code` in the
    /// reply is a known request error
    pub fn interpret(&self, body: Value, context: &ErrorContext) -> EngineResult<TransactionOutcome> {
        if body.get("error_code").is_some() {
            return Err(transaction_error(&body, context));
        }

        match self {
            Self::Start(_) => {
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        context.unknown(format!("Transaction start returned no id: {body}"))
                    })?
                    .to_string();
                Ok(TransactionOutcome::Started(TransactionInfo { id, payload: body }))
            }
            Self::Commit(_) => Ok(TransactionOutcome::Committed),
            Self::Rollback(_) => Ok(TransactionOutcome::RolledBack),
        }
    }
}

/// Error reply of a transaction call
pub fn transaction_error(body: &Value, context: &ErrorContext) -> EngineError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    match body.get("error_code").and_then(Value::as_str) {
        Some(code) => context.known(message, code, body.get("meta").cloned()),
        None => context.unknown(message),
    }
}
