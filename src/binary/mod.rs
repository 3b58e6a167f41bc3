//! # Binary Engine
//!
//! Runs the query engine as a child process and talks to it over HTTP on an
//! ephemeral local port. The child's stdout and stderr carry a line protocol
//! (see [`crate::events::log_line`]) that signals readiness, reports panics and
//! streams logs.
//!
//! Concurrency model:
//! - `start` is single-flight: concurrent callers share one attempt.
//! - `stop` is serialized and idempotent; it waits for in-flight requests.
//! - A detected panic kills the child and cancels in-flight requests.

pub mod connection;
pub mod port;
pub mod process;

pub use connection::{Connection, HttpResponse};
pub use port::free_port;

use crate::config::EngineConfig;
use crate::constants::{http, limits};
use crate::engine::protocol::{self, ErrorContext};
use crate::engine::{
    BatchRequest, Engine, EngineType, Metrics, MetricsFormat, MetricsOptions, QueryResult,
    RequestHeaders, RequestOptions, TransactionOutcome, TransactionRequest,
};
use crate::error::{EngineError, EngineResult, NetworkErrorCode};
use crate::events::{
    classify_line, keep_first_error, trace_event, EngineEvent, EngineEventLevel, EventPublisher,
    LogLine, RustError, SpanExporter, TracingSpanExporter,
};
use crate::locate::{locate_engine, ArtifactKind};
use crate::logging::log_engine_error;
use crate::registry::{EngineRegistry, ShutdownTarget};
use crate::resilience::{run_with_retries, AsyncErrorSource, RetryPolicy};
use crate::state_machine::{EngineLifecycle, EngineState, LifecycleEvent};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use process::ExitKind;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SharedStart = Shared<BoxFuture<'static, EngineResult<()>>>;

/// Running child process
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Engine backed by a spawned child process
pub struct BinaryEngine {
    inner: Arc<BinaryEngineInner>,
}

struct BinaryEngineInner {
    id: String,
    config: EngineConfig,
    policy: RetryPolicy,
    context: ErrorContext,
    connection: Connection,
    events: EventPublisher,
    span_exporter: Mutex<Arc<dyn SpanExporter>>,
    registry: &'static EngineRegistry,
    lifecycle: Mutex<EngineLifecycle>,
    last_error: Mutex<Option<RustError>>,
    diagnostics: Mutex<VecDeque<String>>,
    start_slot: Mutex<Option<(u64, SharedStart)>>,
    start_generation: AtomicU64,
    pending_start: Mutex<Option<oneshot::Sender<EngineResult<()>>>>,
    process: Mutex<Option<ProcessHandle>>,
    binary_path: Mutex<Option<PathBuf>>,
    stop_lock: tokio::sync::Mutex<()>,
    in_flight: RwLock<()>,
    cancel_requests: Notify,
    stop_requested: AtomicBool,
    received_signal: Mutex<Option<String>>,
    version: Mutex<Option<String>>,
}

impl BinaryEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_registry(config, EngineRegistry::global())
    }

    pub fn with_registry(
        mut config: EngineConfig,
        registry: &'static EngineRegistry,
    ) -> EngineResult<Self> {
        config.apply_environment_overrides();
        config.validate()?;

        let id = format!("binary-{}", Uuid::new_v4());
        let policy = RetryPolicy::from_config(&config);
        let mut context = ErrorContext::new(
            config.client_version.clone(),
            config.platform.clone(),
            EngineType::Binary.as_str(),
        );
        context.engine_version = config.engine_version.clone();

        let inner = Arc::new(BinaryEngineInner {
            lifecycle: Mutex::new(EngineLifecycle::new(
                id.clone(),
                EngineType::Binary.as_str(),
                policy.max_starts,
            )),
            events: EventPublisher::new(config.event_channel_capacity),
            id,
            policy,
            context,
            connection: Connection::new(),
            span_exporter: Mutex::new(Arc::new(TracingSpanExporter)),
            registry,
            last_error: Mutex::new(None),
            diagnostics: Mutex::new(VecDeque::new()),
            start_slot: Mutex::new(None),
            start_generation: AtomicU64::new(0),
            pending_start: Mutex::new(None),
            process: Mutex::new(None),
            binary_path: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
            in_flight: RwLock::new(()),
            cancel_requests: Notify::new(),
            stop_requested: AtomicBool::new(false),
            received_signal: Mutex::new(None),
            version: Mutex::new(None),
            config,
        });

        let target: Arc<dyn ShutdownTarget> = inner.clone();
        let weak: Weak<dyn ShutdownTarget> = Arc::downgrade(&target);
        registry.register(inner.id.clone(), weak);

        info!(
            engine_id = %inner.id,
            endpoint = ?inner.config.engine_endpoint,
            max_starts = inner.policy.max_starts,
            "🚀 Binary query engine created"
        );
        Ok(Self { inner })
    }

    /// Replace the destination of engine tracing spans
    pub fn set_span_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        *self.inner.span_exporter.lock() = exporter;
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Port of the running engine, if any
    pub fn port(&self) -> Option<u16> {
        self.inner.connection.base_url().and_then(|url| url.port())
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.process.lock().as_ref().and_then(|p| p.pid)
    }

    /// Number of starts since the last successful request
    pub fn start_count(&self) -> u32 {
        self.inner.lifecycle.lock().start_count()
    }

    /// Kill the engine as if the host received `signal`; later requests fail
    pub async fn kill(&self, signal: &str) {
        self.inner.shutdown(Some(signal)).await;
    }
}

impl Drop for BinaryEngine {
    fn drop(&mut self) {
        self.inner.registry.unregister(&self.inner.id);
        self.inner.start_slot.lock().take();
        self.inner.send_kill();
    }
}

impl BinaryEngineInner {
    fn state(&self) -> EngineState {
        self.lifecycle.lock().state()
    }

    fn transition(&self, event: LifecycleEvent) -> EngineResult<EngineState> {
        Ok(self.lifecycle.lock().transition(event)?)
    }

    fn capture_error(&self, error: RustError) {
        keep_first_error(&mut self.last_error.lock(), error);
    }

    fn resolve_pending_start(&self, result: EngineResult<()>) -> bool {
        match self.pending_start.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    fn send_kill(&self) {
        if let Some(process) = self.process.lock().as_mut() {
            if let Some(kill_tx) = process.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }

    /// Kill the child and wait until it has exited
    async fn terminate_process(&self) {
        let handle = self.process.lock().take();
        if let Some(mut handle) = handle {
            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            let _ = handle.watcher.await;
        }
    }

    fn clear_start_slot(&self, generation: u64) {
        let mut slot = self.start_slot.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            slot.take();
        }
    }

    fn publish(&self, event: EngineEvent) {
        trace_event(&self.id, &event);
        self.events.publish(event);
    }

    fn engine_url(port: u16) -> String {
        format!("http://{}:{port}", http::LOCALHOST)
    }

    async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let shared = {
            let mut slot = self.start_slot.lock();
            match slot.as_ref() {
                Some((_, shared)) => shared.clone(),
                None => {
                    if self.state().is_running() {
                        return Ok(());
                    }
                    let generation = self.start_generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.clone();
                    let shared = async move { inner.run_start(generation).await }
                        .boxed()
                        .shared();
                    *slot = Some((generation, shared.clone()));
                    shared
                }
            }
        };
        shared.await
    }

    async fn run_start(self: Arc<Self>, generation: u64) -> EngineResult<()> {
        let result = self.clone().start_transport().await;

        match &result {
            Ok(()) => {
                if self.state() == EngineState::Starting {
                    self.transition(LifecycleEvent::Ready)?;
                }
            }
            Err(err) => {
                log_engine_error(&self.id, "start", err.kind(), &err.to_string());
                self.clear_start_slot(generation);
                if self.state() == EngineState::Starting {
                    let _ = self.transition(LifecycleEvent::start_failed(err.to_string()));
                }
                self.terminate_process().await;
                self.connection.close();

                // Non-panic errors are already part of the start failure.
                let mut last_error = self.last_error.lock();
                if last_error.as_ref().is_some_and(|e| !e.is_panic) {
                    last_error.take();
                }
            }
        }
        result
    }

    async fn start_transport(self: Arc<Self>) -> EngineResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state().is_crashed() && lifecycle.restart_budget_exhausted() {
                lifecycle.record_refused_start();
                return Err(EngineError::EngineStuck);
            }
            lifecycle.transition(LifecycleEvent::Start)?;
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.last_error.lock().take();
        self.diagnostics.lock().clear();

        if let Some(endpoint) = self.config.engine_endpoint.clone() {
            return self.connect_remote(&endpoint).await;
        }

        let binary_path = locate_engine(&self.config, ArtifactKind::Binary, &self.context)?;
        *self.binary_path.lock() = Some(binary_path.clone());
        let port = free_port().await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        *self.pending_start.lock() = Some(ready_tx);

        debug!(
            engine_id = %self.id,
            binary = %binary_path.display(),
            port = port,
            "spawning query engine"
        );

        let mut child = match process::spawn_engine(&binary_path, &self.config, port) {
            Ok(child) => child,
            Err(e) => {
                self.pending_start.lock().take();
                return Err(self.context.initialization(
                    format!(
                        "Couldn't start query engine at {}: {e}",
                        binary_path.display()
                    ),
                    None,
                ));
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let readers = vec![
            stdout.map(|out| self.spawn_reader(out, port)),
            stderr.map(|err| self.spawn_reader(err, port)),
        ];

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(self.clone().watch_process(child, kill_rx, readers, binary_path));
        *self.process.lock() = Some(ProcessHandle {
            pid,
            kill_tx: Some(kill_tx),
            watcher,
        });

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .context
                .initialization("Query engine exited before it was ready", None)),
        }
    }

    async fn connect_remote(&self, endpoint: &str) -> EngineResult<()> {
        self.connection.open(endpoint)?;

        let mut delay = limits::STATUS_PROBE_BASE_DELAY;
        let mut last_failure = String::new();
        for attempt in 1..=limits::STATUS_PROBE_ATTEMPTS {
            match self.connection.get(http::STATUS_PATH).await {
                Ok(response) if response.is_success() => {
                    info!(engine_id = %self.id, endpoint = %endpoint, "✅ Connected to remote query engine");
                    return Ok(());
                }
                Ok(response) => last_failure = format!("status {}", response.status),
                Err(err) => last_failure = err.to_string(),
            }
            debug!(attempt = attempt, failure = %last_failure, "remote engine not ready yet");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(limits::STATUS_PROBE_MAX_DELAY);
        }

        Err(self.context.initialization(
            format!("Could not reach the query engine at {endpoint}: {last_failure}"),
            None,
        ))
    }

    fn spawn_reader<R>(self: &Arc<Self>, stream: R, port: u16) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => inner.handle_line(&line, port),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(engine_id = %inner.id, error = %e, "engine output stream failed");
                        break;
                    }
                }
            }
        })
    }

    fn handle_line(&self, line: &str, port: u16) {
        match classify_line(line) {
            LogLine::RustError(rust_error) => {
                let start_error = self
                    .context
                    .initialization(rust_error.message.clone(), rust_error.error_code.clone());
                self.capture_error(rust_error.clone());
                self.resolve_pending_start(Err(start_error));

                if rust_error.is_panic {
                    error!(engine_id = %self.id, message = %rust_error.message, "💥 Query engine panicked");
                    self.publish(EngineEvent::new(
                        EngineEventLevel::Error,
                        rust_error.message.clone(),
                        "query_engine",
                    ));
                    self.send_kill();
                    self.cancel_requests.notify_waiters();
                }
            }
            LogLine::Ready => {
                let result = self.connection.open(&Self::engine_url(port));
                if self.resolve_pending_start(result) {
                    info!(engine_id = %self.id, port = port, "✅ Query engine ready");
                }
            }
            LogLine::Spans(spans) => {
                if self.config.tracing_enabled {
                    let exporter = self.span_exporter.lock().clone();
                    exporter.export(spans);
                }
            }
            LogLine::Log(log) => {
                if log.is_error_log() {
                    self.capture_error(log.to_error());
                }
                self.publish(log.to_event());
            }
            LogLine::Raw(text) => {
                debug!(engine_id = %self.id, line = %text, "engine output");
                let mut diagnostics = self.diagnostics.lock();
                if diagnostics.len() == limits::STDERR_BUFFER_LINES {
                    diagnostics.pop_front();
                }
                diagnostics.push_back(text);
            }
            LogLine::Noise => {}
        }
    }

    async fn watch_process(
        self: Arc<Self>,
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
        readers: Vec<Option<JoinHandle<()>>>,
        binary_path: PathBuf,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    debug!(engine_id = %self.id, error = %e, "engine already gone");
                }
                child.wait().await
            }
        };

        // A final panic line must be captured before the exit is handled.
        for reader in readers.into_iter().flatten() {
            let _ = reader.await;
        }

        let exit = match &status {
            Ok(status) => ExitKind::from_status(status),
            Err(_) => ExitKind::Unknown,
        };
        self.handle_exit(exit, &binary_path);
    }

    fn handle_exit(&self, exit: ExitKind, binary_path: &std::path::Path) {
        if self.stop_requested.load(Ordering::SeqCst) {
            debug!(engine_id = %self.id, exit = ?exit, "query engine stopped");
            self.resolve_pending_start(Ok(()));
            return;
        }

        self.connection.close();
        if let Some(error) = process::exit_error(exit) {
            self.capture_error(error);
        }

        let message = {
            let captured = self.last_error.lock().clone();
            let diagnostics: Vec<String> = self.diagnostics.lock().iter().cloned().collect();
            process::exit_message(exit, binary_path, captured.as_ref(), &diagnostics)
        };

        if self.resolve_pending_start(Err(self.context.initialization(message.clone(), None))) {
            warn!(engine_id = %self.id, exit = ?exit, "query engine exited during startup");
            return;
        }

        if self.state() == EngineState::Running {
            let _ = self.transition(LifecycleEvent::crash(message.clone()));
            let generation = self.start_generation.load(Ordering::SeqCst);
            self.clear_start_slot(generation);
            self.cancel_requests.notify_waiters();
            error!(engine_id = %self.id, exit = ?exit, "query engine exited unexpectedly");
            self.publish(EngineEvent::new(EngineEventLevel::Error, message, "query_engine"));
        }
    }

    fn shutdown_error(&self) -> Option<EngineError> {
        self.received_signal.lock().as_ref().map(|signal| {
            self.context.unknown(format!(
                "The host process already received a {signal} signal and the query engine was \
                 terminated. No further requests are possible."
            ))
        })
    }

    /// Post with cancellation on engine panic or crash
    async fn post(&self, path: &str, body: &Value, headers: &RequestHeaders) -> EngineResult<HttpResponse> {
        let cancelled = self.cancel_requests.notified();
        tokio::select! {
            response = self.connection.post(path, body, headers) => response,
            _ = cancelled => Err(EngineError::network(
                NetworkErrorCode::Destroyed,
                "request cancelled because the query engine went away",
            )),
        }
    }

    fn http_error(&self, response: HttpResponse) -> EngineError {
        match response.body.get("errors") {
            Some(Value::Array(errors)) if !errors.is_empty() => self.context.graphql_errors(errors),
            _ => self.context.unknown(format!(
                "Query engine responded with status {}: {}",
                response.status, response.body
            )),
        }
    }

    async fn query_attempt(
        self: &Arc<Self>,
        path: &str,
        body: &Value,
        headers: &RequestHeaders,
    ) -> EngineResult<HttpResponse> {
        if let Some(err) = self.shutdown_error() {
            return Err(err);
        }
        self.start().await?;
        let response = self.post(path, body, headers).await?;
        Connection::on_http_error(response, |response| self.http_error(response))
    }

    fn record_success(&self) {
        self.lifecycle.lock().record_successful_request();
    }
}

impl AsyncErrorSource for BinaryEngineInner {
    fn take_async_error(&self) -> Option<EngineError> {
        self.last_error
            .lock()
            .take()
            .map(|error| self.context.from_rust_error(&error))
    }

    fn restart_budget_exceeded(&self) -> bool {
        self.lifecycle.lock().restart_budget_exceeded()
    }
}

#[async_trait]
impl ShutdownTarget for BinaryEngineInner {
    async fn shutdown(&self, signal: Option<&str>) {
        if let Some(signal) = signal {
            *self.received_signal.lock() = Some(signal.to_string());
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.terminate_process().await;
        self.connection.close();
        self.cancel_requests.notify_waiters();
    }
}

#[async_trait]
impl Engine for BinaryEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Binary
    }

    fn state(&self) -> EngineState {
        self.inner.state()
    }

    async fn start(&self) -> EngineResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let _serialized = inner.stop_lock.lock().await;

        let pending = inner.start_slot.lock().as_ref().map(|(_, shared)| shared.clone());
        let state = inner.state();
        if pending.is_none() && !state.is_active() && !state.is_crashed() {
            return Ok(());
        }

        inner.stop_requested.store(true, Ordering::SeqCst);
        let was_starting = state == EngineState::Starting;
        if inner.lifecycle.lock().can_transition(&LifecycleEvent::Stop) {
            inner.transition(LifecycleEvent::Stop)?;
        }

        if let Some(pending) = pending {
            if was_starting {
                inner.send_kill();
            }
            if let Err(err) = pending.await {
                debug!(engine_id = %inner.id, error = %err, "start failed while stopping");
            }
            // A start that had not run yet when the stop began may have completed.
            inner.stop_requested.store(true, Ordering::SeqCst);
            if inner.lifecycle.lock().can_transition(&LifecycleEvent::Stop) {
                inner.transition(LifecycleEvent::Stop)?;
            }
        }

        let _no_requests = inner.in_flight.write().await;
        inner.terminate_process().await;
        inner.connection.close();
        inner.start_slot.lock().take();

        if inner.state() == EngineState::Stopping {
            inner.transition(LifecycleEvent::Stopped)?;
        }
        if inner.state() == EngineState::Stopped {
            inner.transition(LifecycleEvent::Reset)?;
        }
        inner.stop_requested.store(false, Ordering::SeqCst);
        info!(engine_id = %inner.id, "🛑 Query engine stopped");
        Ok(())
    }

    async fn request(&self, query: &str, options: RequestOptions) -> EngineResult<QueryResult> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;
        let body = protocol::query_body(query);

        let result = run_with_retries(&inner.policy, options.is_write, inner.as_ref(), |num_try| {
            let body = &body;
            let headers = &options.headers;
            async move {
                debug!(engine_id = %inner.id, num_try = num_try, "engine request");
                let response = inner.query_attempt(http::QUERY_PATH, body, headers).await?;
                let elapsed = protocol::elapsed_ms(response.header(http::ELAPSED_HEADER));
                protocol::parse_query_response(response.body, elapsed, &inner.context)
            }
        })
        .await;

        if result.is_ok() {
            inner.record_success();
        }
        result
    }

    async fn request_batch(
        &self,
        batch: BatchRequest,
    ) -> EngineResult<Vec<EngineResult<QueryResult>>> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;
        let body = protocol::batch_body(&batch);

        let result = run_with_retries(&inner.policy, batch.contains_write, inner.as_ref(), |_| {
            let body = &body;
            let headers = &batch.headers;
            async move {
                let response = inner.query_attempt(http::QUERY_PATH, body, headers).await?;
                let elapsed = protocol::elapsed_ms(response.header(http::ELAPSED_HEADER));
                protocol::parse_batch_response(response.body, elapsed, &inner.context)
            }
        })
        .await;

        if result.is_ok() {
            inner.record_success();
        }
        result
    }

    async fn transaction(
        &self,
        request: TransactionRequest,
        headers: RequestHeaders,
    ) -> EngineResult<TransactionOutcome> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;

        let attempt = async {
            if let Some(err) = inner.shutdown_error() {
                return Err(err);
            }
            inner.start().await?;
            let response = inner.post(&request.http_path(), &request.body(), &headers).await?;
            let response = Connection::on_http_error(response, |response| {
                crate::engine::transaction::transaction_error(&response.body, &inner.context)
            })?;
            request.interpret(response.body, &inner.context)
        };

        match attempt.await {
            Ok(outcome) => {
                debug!(engine_id = %inner.id, action = request.action(), "transaction call succeeded");
                Ok(outcome)
            }
            Err(err) if err.is_known_request() => Err(err),
            Err(err) => Err(inner.take_async_error().unwrap_or(err)),
        }
    }

    async fn metrics(&self, options: MetricsOptions) -> EngineResult<Metrics> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;
        let path = format!("{}?format={}", http::METRICS_PATH, options.format.as_str());
        let body = json!({ "globalLabels": options.global_labels });

        let response = inner
            .query_attempt(&path, &body, &RequestHeaders::default())
            .await?;
        match options.format {
            MetricsFormat::Json => Ok(Metrics::Json(response.body)),
            MetricsFormat::Prometheus => match response.body {
                Value::String(text) => Ok(Metrics::Prometheus(text)),
                other => Ok(Metrics::Prometheus(other.to_string())),
            },
        }
    }

    async fn version(&self) -> EngineResult<String> {
        let inner = &self.inner;
        let cached = inner.version.lock().clone();
        if let Some(version) = cached {
            return Ok(version);
        }
        if inner.config.engine_endpoint.is_some() {
            return Ok(inner
                .config
                .engine_version
                .clone()
                .unwrap_or_else(|| "unknown".to_string()));
        }

        let known_path = inner.binary_path.lock().clone();
        let binary_path = match known_path {
            Some(path) => path,
            None => locate_engine(&inner.config, ArtifactKind::Binary, &inner.context)?,
        };
        let output = tokio::process::Command::new(&binary_path)
            .arg(crate::constants::flags::VERSION)
            .current_dir(&inner.config.cwd)
            .output()
            .await
            .map_err(|e| {
                inner.context.initialization(
                    format!("Couldn't run {} --version: {e}", binary_path.display()),
                    None,
                )
            })?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        *inner.version.lock() = Some(version.clone());
        Ok(version)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn status_endpoint() -> String {
        let app = axum::Router::new().route("/status", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_stop_wins_over_a_start_that_has_not_run_yet() {
        let config = EngineConfig {
            engine_endpoint: Some(status_endpoint().await),
            ..EngineConfig::default()
        };
        let registry: &'static EngineRegistry = Box::leak(Box::new(EngineRegistry::new()));
        let engine = BinaryEngine::with_registry(config, registry).unwrap();

        // Register a start the way `start()` does, without polling it.
        let inner = engine.inner.clone();
        let generation = inner.start_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = {
            let inner = inner.clone();
            async move { inner.run_start(generation).await }.boxed().shared()
        };
        *inner.start_slot.lock() = Some((generation, shared.clone()));
        assert_eq!(engine.state(), EngineState::NotStarted);

        let starter = tokio::spawn(shared);
        engine.stop().await.unwrap();
        starter.await.unwrap().unwrap();

        assert_eq!(engine.state(), EngineState::NotStarted);
        assert!(!inner.connection.is_open());
    }
}
