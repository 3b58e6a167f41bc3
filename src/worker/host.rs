//! Worker side: a dedicated thread running a current-thread runtime that hosts
//! a [`LibraryEngine`] and serves requests from the proxy.

use super::protocol::{
    WireError, WorkerAction, WorkerMessage, WorkerRequest, ENGINE_EVENT, STATE_CHANGED,
};
use crate::engine::{
    BatchRequest, Engine, MetricsOptions, RequestHeaders, RequestOptions, TransactionRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::library::LibraryEngine;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub type EngineFactory = Box<dyn FnOnce() -> EngineResult<LibraryEngine> + Send + 'static>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestArgs {
    pub query: String,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionArgs {
    pub request: TransactionRequest,
    #[serde(default)]
    pub headers: RequestHeaders,
}

/// Start the detached worker thread. `ready` receives the outcome of building
/// the engine; the thread exits once the request channel closes.
pub fn spawn_worker(
    name: String,
    factory: EngineFactory,
    requests: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
    ready: oneshot::Sender<EngineResult<()>>,
) -> EngineResult<()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready.send(Err(EngineError::WorkerExited {
                        reason: format!("cannot build worker runtime: {e}"),
                    }));
                    return;
                }
            };

            runtime.block_on(async move {
                let engine = match factory() {
                    Ok(engine) => Arc::new(engine),
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));
                serve(engine, requests, replies).await;
            });
        })
        .map(|_detached| ())
        .map_err(|e| EngineError::WorkerExited {
            reason: format!("cannot spawn worker thread: {e}"),
        })
}

fn send(replies: &mpsc::UnboundedSender<String>, message: &WorkerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = replies.send(text);
        }
        Err(e) => error!(error = %e, "cannot encode worker message"),
    }
}

fn notify<T: Serialize>(replies: &mpsc::UnboundedSender<String>, event: &str, data: &T) {
    if let Ok(data) = serde_json::to_value(data) {
        send(
            replies,
            &WorkerMessage::Notification {
                event: event.to_string(),
                data,
            },
        );
    }
}

async fn serve(
    engine: Arc<LibraryEngine>,
    mut requests: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
) {
    info!(engine_id = %engine.id(), "🧵 Engine worker serving");

    let mut events = engine.subscribe();
    let event_replies = replies.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => notify(&event_replies, ENGINE_EVENT, &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "worker event forwarder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(text) = requests.recv().await {
        let request: WorkerRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed worker request");
                continue;
            }
        };

        let engine = engine.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            debug!(id = %request.id, action = ?request.action, "worker request");
            let result = AssertUnwindSafe(dispatch(&engine, request.action, request.data))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(id = %request.id, "engine worker call panicked");
                    Err(EngineError::unknown(
                        "The engine worker panicked while handling the call",
                        engine.client_version(),
                    ))
                });
            notify(&replies, STATE_CHANGED, &engine.state());
            let message = match result {
                Ok(data) => WorkerMessage::Reply {
                    id: request.id,
                    data,
                },
                Err(e) => WorkerMessage::Failure {
                    id: request.id,
                    error: WireError::from(&e),
                },
            };
            send(&replies, &message);
        });
    }

    if let Err(e) = engine.stop().await {
        warn!(error = %e, "engine failed to stop when the proxy went away");
    }
    forwarder.abort();
    debug!("engine worker finished");
}

fn decode<T: DeserializeOwned>(data: Value) -> EngineResult<T> {
    serde_json::from_value(data)
        .map_err(|e| EngineError::Configuration(format!("malformed worker request: {e}")))
}

fn encode<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| EngineError::Configuration(format!("cannot encode worker reply: {e}")))
}

async fn dispatch(engine: &LibraryEngine, action: WorkerAction, data: Value) -> EngineResult<Value> {
    match action {
        WorkerAction::Start => {
            engine.start().await?;
            Ok(Value::Null)
        }
        WorkerAction::Stop => {
            engine.stop().await?;
            Ok(Value::Null)
        }
        WorkerAction::Request => {
            let args: RequestArgs = decode(data)?;
            encode(&engine.request(&args.query, args.options).await?)
        }
        WorkerAction::RequestBatch => {
            let batch: BatchRequest = decode(data)?;
            let results: Vec<Result<_, WireError>> = engine
                .request_batch(batch)
                .await?
                .into_iter()
                .map(|item| item.map_err(|e| WireError::from(&e)))
                .collect();
            encode(&results)
        }
        WorkerAction::Transaction => {
            let args: TransactionArgs = decode(data)?;
            encode(&engine.transaction(args.request, args.headers).await?)
        }
        WorkerAction::Metrics => {
            let options: MetricsOptions = decode(data)?;
            encode(&engine.metrics(options).await?)
        }
        WorkerAction::Version => encode(&engine.version().await?),
    }
}
