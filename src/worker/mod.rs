//! # Worker Engine
//!
//! Hosts a [`LibraryEngine`] on its own OS thread and exposes it through the
//! [`Engine`] contract by message passing. Every call gets a fresh correlation
//! id; replies are matched back to the waiting caller and notifications are
//! republished in arrival order.

pub mod host;
pub mod protocol;

pub use protocol::{WireError, WireErrorKind, WorkerAction, WorkerMessage, WorkerRequest};

use crate::config::EngineConfig;
use crate::engine::{
    BatchRequest, Engine, EngineType, Metrics, MetricsOptions, QueryResult, RequestHeaders,
    RequestOptions, TransactionOutcome, TransactionRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventPublisher};
use crate::library::{DefaultLibraryLoader, LibraryEngine, LibraryLoader};
use crate::registry::EngineRegistry;
use crate::state_machine::EngineState;
use async_trait::async_trait;
use dashmap::DashMap;
use host::{RequestArgs, TransactionArgs};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingReply = oneshot::Sender<Result<Value, WireError>>;

/// Proxy for an engine running on a worker thread
pub struct WorkerEngine {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: String,
    client_version: String,
    requests: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: DashMap<String, PendingReply>,
    events: EventPublisher,
    state: Mutex<EngineState>,
    exited: AtomicBool,
}

impl WorkerEngine {
    /// Spawn a worker hosting a library engine loaded from disk
    pub async fn spawn(config: EngineConfig) -> EngineResult<Self> {
        Self::spawn_with_loader(config, Arc::new(DefaultLibraryLoader), EngineRegistry::global()).await
    }

    pub async fn spawn_with_loader(
        config: EngineConfig,
        loader: Arc<dyn LibraryLoader>,
        registry: &'static EngineRegistry,
    ) -> EngineResult<Self> {
        let id = format!("worker-{}", Uuid::new_v4());
        let client_version = config.client_version.clone();
        let events = EventPublisher::new(config.event_channel_capacity);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let factory: host::EngineFactory =
            Box::new(move || LibraryEngine::with_loader(config, loader, registry));
        host::spawn_worker(
            format!("query-engine-{id}"),
            factory,
            request_rx,
            reply_tx,
            ready_tx,
        )?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(EngineError::WorkerExited {
                    reason: "worker thread exited during startup".to_string(),
                })
            }
        }

        let inner = Arc::new(WorkerInner {
            id,
            client_version,
            requests: Mutex::new(Some(request_tx)),
            pending: DashMap::new(),
            events,
            state: Mutex::new(EngineState::NotStarted),
            exited: AtomicBool::new(false),
        });
        tokio::spawn(inner.clone().read_replies(reply_rx));

        info!(engine_id = %inner.id, "🧵 Worker query engine created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Calls awaiting a reply from the worker
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        // Closing the request channel lets the worker stop its engine and exit.
        self.inner.requests.lock().take();
    }
}

impl WorkerInner {
    async fn read_replies(self: Arc<Self>, mut replies: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = replies.recv().await {
            let message: WorkerMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!(engine_id = %self.id, error = %e, "dropping malformed worker message");
                    continue;
                }
            };
            self.handle_message(message);
        }

        self.exited.store(true, Ordering::SeqCst);
        let pending = self.pending.len();
        // Dropping the senders fails every waiting caller with WorkerExited.
        self.pending.clear();
        debug!(engine_id = %self.id, pending = pending, "worker reply channel closed");
    }

    fn handle_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Reply { id, data } => self.resolve(&id, Ok(data)),
            WorkerMessage::Failure { id, error } => self.resolve(&id, Err(error)),
            WorkerMessage::Notification { event, data } => match event.as_str() {
                protocol::ENGINE_EVENT => match serde_json::from_value::<EngineEvent>(data) {
                    Ok(event) => self.events.publish(event),
                    Err(e) => warn!(engine_id = %self.id, error = %e, "malformed engine event"),
                },
                protocol::STATE_CHANGED => {
                    if let Ok(state) = serde_json::from_value::<EngineState>(data) {
                        *self.state.lock() = state;
                    }
                }
                other => debug!(engine_id = %self.id, event = other, "ignoring worker notification"),
            },
        }
    }

    fn resolve(&self, id: &str, result: Result<Value, WireError>) {
        match self.pending.remove(id) {
            Some((_, sender)) => {
                let _ = sender.send(result);
            }
            None => debug!(engine_id = %self.id, id = id, "reply for unknown worker call"),
        }
    }

    fn exited_error(&self) -> EngineError {
        EngineError::WorkerExited {
            reason: "the engine worker thread is no longer running".to_string(),
        }
    }

    async fn call(&self, action: WorkerAction, data: Value) -> EngineResult<Value> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(self.exited_error());
        }

        let id = Uuid::new_v4().to_string();
        let request = WorkerRequest {
            id: id.clone(),
            action,
            data,
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| EngineError::Configuration(format!("cannot encode worker request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if self.exited.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(self.exited_error());
        }

        let sent = match self.requests.lock().as_ref() {
            Some(requests) => requests.send(text).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.remove(&id);
            return Err(self.exited_error());
        }

        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(wire)) => Err(wire.into_engine_error()),
            Err(_) => Err(self.exited_error()),
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, action: WorkerAction, data: Value) -> EngineResult<T> {
        let reply = self.call(action, data).await?;
        serde_json::from_value(reply).map_err(|e| {
            EngineError::unknown(format!("malformed worker reply: {e}"), self.client_version.clone())
        })
    }

    fn encode<T: Serialize>(&self, value: &T) -> EngineResult<Value> {
        serde_json::to_value(value)
            .map_err(|e| EngineError::Configuration(format!("cannot encode worker request: {e}")))
    }
}

#[async_trait]
impl Engine for WorkerEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Worker
    }

    fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    async fn start(&self) -> EngineResult<()> {
        self.inner.call(WorkerAction::Start, Value::Null).await?;
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.inner.call(WorkerAction::Stop, Value::Null).await?;
        Ok(())
    }

    async fn request(&self, query: &str, options: RequestOptions) -> EngineResult<QueryResult> {
        let args = self.inner.encode(&RequestArgs {
            query: query.to_string(),
            options,
        })?;
        self.inner.call_as(WorkerAction::Request, args).await
    }

    async fn request_batch(
        &self,
        batch: BatchRequest,
    ) -> EngineResult<Vec<EngineResult<QueryResult>>> {
        let args = self.inner.encode(&batch)?;
        let results: Vec<Result<QueryResult, WireError>> =
            self.inner.call_as(WorkerAction::RequestBatch, args).await?;
        Ok(results
            .into_iter()
            .map(|item| item.map_err(WireError::into_engine_error))
            .collect())
    }

    async fn transaction(
        &self,
        request: TransactionRequest,
        headers: RequestHeaders,
    ) -> EngineResult<TransactionOutcome> {
        let args = self.inner.encode(&TransactionArgs { request, headers })?;
        self.inner.call_as(WorkerAction::Transaction, args).await
    }

    async fn metrics(&self, options: MetricsOptions) -> EngineResult<Metrics> {
        let args = self.inner.encode(&options)?;
        self.inner.call_as(WorkerAction::Metrics, args).await
    }

    async fn version(&self) -> EngineResult<String> {
        self.inner.call_as(WorkerAction::Version, Value::Null).await
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}
