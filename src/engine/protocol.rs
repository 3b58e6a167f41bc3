//! Request bodies and response decoding shared by the HTTP and native transports.

use crate::engine::{BatchRequest, QueryResult};
use crate::error::{EngineError, EngineResult};
use crate::events::RustError;
use crate::report::{panic_message, ReportContext};
use serde_json::{json, Value};

/// Builds typed errors carrying the engine's identity
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    pub client_version: String,
    pub platform: String,
    pub engine_type: &'static str,
    pub engine_version: Option<String>,
}

impl ErrorContext {
    pub fn new(
        client_version: impl Into<String>,
        platform: impl Into<String>,
        engine_type: &'static str,
    ) -> Self {
        Self {
            client_version: client_version.into(),
            platform: platform.into(),
            engine_type,
            engine_version: None,
        }
    }

    pub fn panic(&self, message: &str) -> EngineError {
        let report = ReportContext {
            client_version: &self.client_version,
            engine_version: self.engine_version.as_deref(),
            platform: &self.platform,
            engine_type: self.engine_type,
            error_message: message,
        };
        EngineError::RustPanic {
            message: panic_message(&report),
            client_version: self.client_version.clone(),
        }
    }

    pub fn known(&self, message: impl Into<String>, code: impl Into<String>, meta: Option<Value>) -> EngineError {
        EngineError::known(message, code, meta, self.client_version.clone())
    }

    pub fn unknown(&self, message: impl Into<String>) -> EngineError {
        EngineError::unknown(message, self.client_version.clone())
    }

    pub fn initialization(&self, message: impl Into<String>, error_code: Option<String>) -> EngineError {
        EngineError::initialization_with_code(message, self.client_version.clone(), error_code)
    }

    /// Error captured from the log stream, as surfaced to a caller
    pub fn from_rust_error(&self, error: &RustError) -> EngineError {
        if error.is_panic {
            self.panic(&error.full_message())
        } else {
            self.unknown(error.full_message())
        }
    }

    /// Convert one entry of a response's `errors` array
    pub fn graphql_error(&self, error: &Value) -> EngineError {
        let user_facing = error.get("user_facing_error");
        let message = user_facing
            .and_then(|u| u.get("message"))
            .or_else(|| error.get("error"))
            .or_else(|| error.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        if let Some(user_facing) = user_facing {
            if user_facing.get("is_panic").and_then(Value::as_bool) == Some(true) {
                return self.panic(&message);
            }
            if let Some(code) = user_facing.get("error_code").and_then(Value::as_str) {
                return self.known(message, code, user_facing.get("meta").cloned());
            }
        }

        self.unknown(message)
    }

    /// Convert a non-empty `errors` array
    pub fn graphql_errors(&self, errors: &[Value]) -> EngineError {
        match errors {
            [single] => self.graphql_error(single),
            many => self.unknown(Value::Array(many.to_vec()).to_string()),
        }
    }
}

/// Body of a single query request
pub fn query_body(query: &str) -> Value {
    json!({ "variables": {}, "query": query })
}

/// Body of a batch request
pub fn batch_body(batch: &BatchRequest) -> Value {
    let queries: Vec<Value> = batch
        .queries
        .iter()
        .map(|query| json!({ "query": query, "variables": {} }))
        .collect();

    let mut body = json!({
        "batch": queries,
        "transaction": batch.transaction.is_some(),
    });
    if let Some(Some(level)) = batch.transaction.as_ref().map(|t| t.isolation_level) {
        body["isolationLevel"] = json!(level);
    }
    body
}

fn response_errors(body: &Value) -> Option<&[Value]> {
    match body.get("errors") {
        Some(Value::Array(errors)) if !errors.is_empty() => Some(errors.as_slice()),
        _ => None,
    }
}

/// Decode a single query response
pub fn parse_query_response(
    body: Value,
    elapsed: Option<f64>,
    context: &ErrorContext,
) -> EngineResult<QueryResult> {
    if let Some(errors) = response_errors(&body) {
        return Err(context.graphql_errors(errors));
    }
    Ok(QueryResult {
        data: body,
        elapsed,
    })
}

/// Decode a batch response into one result per query
pub fn parse_batch_response(
    body: Value,
    elapsed: Option<f64>,
    context: &ErrorContext,
) -> EngineResult<Vec<EngineResult<QueryResult>>> {
    if let Some(errors) = response_errors(&body) {
        return Err(context.graphql_errors(errors));
    }

    let items = match body.get("batchResult") {
        Some(Value::Array(items)) => items.clone(),
        _ => return Err(context.unknown(format!("Batch response has no batchResult: {body}"))),
    };

    Ok(items
        .into_iter()
        .map(|item| match response_errors(&item) {
            Some(errors) => Err(context.graphql_errors(errors)),
            None => Ok(QueryResult {
                data: item,
                elapsed,
            }),
        })
        .collect())
}

/// `x-elapsed` is reported in microseconds
pub fn elapsed_ms(header: Option<&str>) -> Option<f64> {
    header
        .and_then(|value| value.trim().parse::<f64>().ok())
        .map(|micros| micros / 1000.0)
}
