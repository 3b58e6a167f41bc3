//! # Engine Contract
//!
//! [`Engine`] is the single contract application code programs against. It is
//! implemented by the child-process transport ([`BinaryEngine`]), the in-process
//! native library ([`LibraryEngine`]) and the worker-thread proxy
//! ([`WorkerEngine`]).
//!
//! [`BinaryEngine`]: crate::binary::BinaryEngine
//! [`LibraryEngine`]: crate::library::LibraryEngine
//! [`WorkerEngine`]: crate::worker::WorkerEngine

pub mod protocol;
pub mod transaction;

pub use protocol::ErrorContext;
pub use transaction::{
    IsolationLevel, TransactionInfo, TransactionOptions, TransactionOutcome, TransactionRequest,
};

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::state_machine::EngineState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;

/// Transport behind an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Binary,
    Library,
    Worker,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Library => "library",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request headers forwarded to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

impl RequestHeaders {
    pub fn for_transaction(info: &TransactionInfo) -> Self {
        Self {
            transaction_id: Some(info.id.clone()),
            traceparent: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub headers: RequestHeaders,
    /// Writes are never retried
    #[serde(default)]
    pub is_write: bool,
}

impl RequestOptions {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            headers: RequestHeaders::default(),
            is_write: true,
        }
    }

    pub fn with_headers(mut self, headers: RequestHeaders) -> Self {
        self.headers = headers;
        self
    }
}

/// Transaction settings of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransaction {
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub queries: Vec<String>,
    #[serde(default)]
    pub headers: RequestHeaders,
    /// Run the batch inside one transaction
    #[serde(default)]
    pub transaction: Option<BatchTransaction>,
    /// A batch containing a write is never retried
    #[serde(default)]
    pub contains_write: bool,
}

impl BatchRequest {
    pub fn new(queries: Vec<String>) -> Self {
        Self {
            queries,
            ..Self::default()
        }
    }
}

/// Successful query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Value,
    /// Engine-side execution time in milliseconds, when reported
    #[serde(default)]
    pub elapsed: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsFormat {
    #[default]
    Json,
    Prometheus,
}

impl MetricsFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Prometheus => "prometheus",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsOptions {
    #[serde(default)]
    pub format: MetricsFormat,
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "snake_case")]
pub enum Metrics {
    Json(Value),
    Prometheus(String),
}

/// Contract shared by every engine transport
#[async_trait]
pub trait Engine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    fn state(&self) -> EngineState;

    /// Start the engine; concurrent callers share one attempt
    async fn start(&self) -> EngineResult<()>;

    /// Release the engine; a no-op when nothing is running
    async fn stop(&self) -> EngineResult<()>;

    async fn request(&self, query: &str, options: RequestOptions) -> EngineResult<QueryResult>;

    async fn request_batch(
        &self,
        batch: BatchRequest,
    ) -> EngineResult<Vec<EngineResult<QueryResult>>>;

    async fn transaction(
        &self,
        request: TransactionRequest,
        headers: RequestHeaders,
    ) -> EngineResult<TransactionOutcome>;

    async fn metrics(&self, options: MetricsOptions) -> EngineResult<Metrics>;

    async fn version(&self) -> EngineResult<String>;

    /// Events published from now on
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    async fn start_transaction(&self, options: TransactionOptions) -> EngineResult<TransactionInfo> {
        match self
            .transaction(TransactionRequest::Start(options), RequestHeaders::default())
            .await?
        {
            TransactionOutcome::Started(info) => Ok(info),
            other => Err(unexpected_outcome("start", &other)),
        }
    }

    async fn commit_transaction(&self, info: TransactionInfo) -> EngineResult<()> {
        let headers = RequestHeaders::for_transaction(&info);
        match self.transaction(TransactionRequest::Commit(info), headers).await? {
            TransactionOutcome::Committed => Ok(()),
            other => Err(unexpected_outcome("commit", &other)),
        }
    }

    async fn rollback_transaction(&self, info: TransactionInfo) -> EngineResult<()> {
        let headers = RequestHeaders::for_transaction(&info);
        match self.transaction(TransactionRequest::Rollback(info), headers).await? {
            TransactionOutcome::RolledBack => Ok(()),
            other => Err(unexpected_outcome("rollback", &other)),
        }
    }
}

fn unexpected_outcome(action: &str, outcome: &TransactionOutcome) -> EngineError {
    EngineError::UnknownRequest {
        message: format!("Unexpected outcome for transaction {action}: {outcome:?}"),
        client_version: String::new(),
    }
}
