//! # Library Engine
//!
//! Runs the query engine in-process through its native library. Requests are
//! JSON documents passed to [`QueryEngineInstance::call`]; logs arrive through
//! a callback bridged by [`logger::LogBridge`].
//!
//! The library is loaded and instantiated lazily on the first start. Native
//! errors are mapped onto the shared taxonomy: a `GenericFailure` whose message
//! starts with `PANIC:` is a panic, anything else an unknown request error.

pub mod loader;
pub mod logger;
pub mod native;

pub use loader::{DefaultLibraryLoader, LibraryLoader, StaticLibraryLoader};
pub use logger::LogBridge;

use crate::config::EngineConfig;
use crate::constants::{limits, NATIVE_GENERIC_FAILURE, NATIVE_PANIC_PREFIX};
use crate::engine::protocol::{self, ErrorContext};
use crate::engine::{
    BatchRequest, Engine, EngineType, Metrics, MetricsFormat, MetricsOptions, QueryResult,
    RequestHeaders, RequestOptions, TransactionOutcome, TransactionRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    EngineEvent, EngineEventLevel, EventPublisher, SpanExporter, TracingSpanExporter,
};
use crate::logging::log_engine_error;
use crate::registry::{EngineRegistry, ShutdownTarget};
use crate::resilience::{run_with_retries, AsyncErrorSource, RetryPolicy};
use crate::state_machine::{EngineLifecycle, EngineState, LifecycleEvent};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error returned by a native library call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct NativeError {
    pub code: String,
    pub message: String,
}

impl NativeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_panic(&self) -> bool {
        self.code == NATIVE_GENERIC_FAILURE && self.message.starts_with(NATIVE_PANIC_PREFIX)
    }
}

/// Receives every log line emitted by a library instance
pub type LogCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Methods exposed by a library instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NativeMethod {
    Connect,
    Disconnect,
    Query,
    StartTransaction,
    CommitTransaction,
    RollbackTransaction,
    Metrics,
}

impl NativeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Query => "query",
            Self::StartTransaction => "startTransaction",
            Self::CommitTransaction => "commitTransaction",
            Self::RollbackTransaction => "rollbackTransaction",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryVersion {
    pub commit: String,
    pub version: String,
}

/// Options passed when creating a library instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOptions {
    pub datamodel: String,
    pub env: HashMap<String, String>,
    pub log_queries: bool,
    pub ignore_env_var_errors: bool,
    pub datasource_overrides: HashMap<String, String>,
    pub log_level: String,
    pub config_dir: PathBuf,
}

impl InstanceOptions {
    /// Options for `config`; the caller supplies the schema text
    pub fn from_config(
        config: &EngineConfig,
        datamodel: String,
        process_env: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut env = config.env.clone();
        env.extend(process_env);
        Self {
            datamodel,
            env,
            log_queries: config.log_queries,
            ignore_env_var_errors: config.ignore_env_var_errors,
            datasource_overrides: config.datasource_overrides(),
            log_level: config.log_level.as_str().to_string(),
            config_dir: config.datamodel_dir().unwrap_or_else(|| config.cwd.clone()),
        }
    }
}

/// One engine instance created by a library
#[async_trait]
pub trait QueryEngineInstance: Send + Sync {
    /// Invoke `method` with JSON arguments; the reply is a JSON document
    async fn call(&self, method: NativeMethod, args: Value) -> Result<String, NativeError>;
}

/// Entry points of a loaded engine library
pub trait QueryEngineLibrary: Send + Sync {
    fn version(&self) -> Result<LibraryVersion, NativeError>;

    fn new_instance(
        &self,
        options: &InstanceOptions,
        logger: LogCallback,
    ) -> Result<Arc<dyn QueryEngineInstance>, NativeError>;

    fn get_config(&self, options: &Value) -> Result<String, NativeError>;

    fn dmmf(&self, datamodel: &str) -> Result<String, NativeError>;
}

type SharedStart = Shared<BoxFuture<'static, EngineResult<()>>>;

/// Engine bound to the native library in this process
pub struct LibraryEngine {
    inner: Arc<LibraryEngineInner>,
}

struct LibraryEngineInner {
    id: String,
    config: EngineConfig,
    policy: RetryPolicy,
    context: ErrorContext,
    loader: Arc<dyn LibraryLoader>,
    library: Mutex<Option<Arc<dyn QueryEngineLibrary>>>,
    instance: Mutex<Option<Arc<dyn QueryEngineInstance>>>,
    bridge: Arc<LogBridge>,
    events: EventPublisher,
    span_exporter: Arc<Mutex<Arc<dyn SpanExporter>>>,
    registry: &'static EngineRegistry,
    lifecycle: Mutex<EngineLifecycle>,
    start_slot: Mutex<Option<(u64, SharedStart)>>,
    start_generation: AtomicU64,
    stop_lock: tokio::sync::Mutex<()>,
    in_flight: RwLock<()>,
    received_signal: Mutex<Option<String>>,
}

impl LibraryEngine {
    /// Engine using the platform library found on disk. Must be called inside a
    /// tokio runtime.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_loader(config, Arc::new(DefaultLibraryLoader), EngineRegistry::global())
    }

    pub fn with_loader(
        mut config: EngineConfig,
        loader: Arc<dyn LibraryLoader>,
        registry: &'static EngineRegistry,
    ) -> EngineResult<Self> {
        config.apply_environment_overrides();
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            EngineError::Configuration(format!("library engine requires a tokio runtime: {e}"))
        })?;

        let id = format!("library-{}", Uuid::new_v4());
        let policy = RetryPolicy::from_config(&config);
        let mut context = ErrorContext::new(
            config.client_version.clone(),
            config.platform.clone(),
            EngineType::Library.as_str(),
        );
        context.engine_version = config.engine_version.clone();

        let events = EventPublisher::new(config.event_channel_capacity);
        let span_exporter: Arc<Mutex<Arc<dyn SpanExporter>>> =
            Arc::new(Mutex::new(Arc::new(TracingSpanExporter)));
        let (bridge, receiver) = LogBridge::new(id.clone(), limits::LOG_QUEUE_CAPACITY);
        logger::spawn_consumer(
            &runtime,
            id.clone(),
            receiver,
            events.clone(),
            span_exporter.clone(),
            config.tracing_enabled,
        );

        let inner = Arc::new(LibraryEngineInner {
            lifecycle: Mutex::new(EngineLifecycle::new(
                id.clone(),
                EngineType::Library.as_str(),
                policy.max_starts,
            )),
            id,
            policy,
            context,
            loader,
            library: Mutex::new(None),
            instance: Mutex::new(None),
            bridge,
            events,
            span_exporter,
            registry,
            start_slot: Mutex::new(None),
            start_generation: AtomicU64::new(0),
            stop_lock: tokio::sync::Mutex::new(()),
            in_flight: RwLock::new(()),
            received_signal: Mutex::new(None),
            config,
        });

        let target: Arc<dyn ShutdownTarget> = inner.clone();
        let weak: Weak<dyn ShutdownTarget> = Arc::downgrade(&target);
        registry.register(inner.id.clone(), weak);

        info!(engine_id = %inner.id, "🚀 Library query engine created");
        Ok(Self { inner })
    }

    pub fn set_span_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        *self.inner.span_exporter.lock() = exporter;
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn client_version(&self) -> &str {
        &self.inner.config.client_version
    }

    pub fn start_count(&self) -> u32 {
        self.inner.lifecycle.lock().start_count()
    }

    /// Resolved configuration of the schema, as reported by the library
    pub async fn get_config(&self) -> EngineResult<Value> {
        let inner = &self.inner;
        let library = inner.ensure_library()?;
        let datamodel = inner.read_datamodel().await?;
        let options = json!({
            "datamodel": datamodel,
            "datasourceOverrides": inner.config.datasource_overrides(),
            "ignoreEnvVarErrors": inner.config.ignore_env_var_errors,
            "env": inner.config.env,
        });
        let text = library
            .get_config(&options)
            .map_err(|e| inner.initialization_error(e))?;
        inner.parse_reply(&text)
    }

    /// Data model meta format of the schema
    pub async fn dmmf(&self) -> EngineResult<Value> {
        let inner = &self.inner;
        let library = inner.ensure_library()?;
        let datamodel = inner.read_datamodel().await?;
        let text = library
            .dmmf(&datamodel)
            .map_err(|e| inner.initialization_error(e))?;
        inner.parse_reply(&text)
    }

    /// Fail later requests as if the host received `signal`
    pub async fn kill(&self, signal: &str) {
        self.inner.shutdown(Some(signal)).await;
    }
}

impl Drop for LibraryEngine {
    fn drop(&mut self) {
        self.inner.registry.unregister(&self.inner.id);
        self.inner.start_slot.lock().take();
    }
}

impl LibraryEngineInner {
    fn state(&self) -> EngineState {
        self.lifecycle.lock().state()
    }

    fn transition(&self, event: LifecycleEvent) -> EngineResult<EngineState> {
        Ok(self.lifecycle.lock().transition(event)?)
    }

    fn clear_start_slot(&self, generation: u64) {
        let mut slot = self.start_slot.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            slot.take();
        }
    }

    fn ensure_library(&self) -> EngineResult<Arc<dyn QueryEngineLibrary>> {
        let mut slot = self.library.lock();
        if let Some(library) = slot.as_ref() {
            return Ok(library.clone());
        }
        let library = self.loader.load(&self.config, &self.context)?;
        *slot = Some(library.clone());
        Ok(library)
    }

    async fn read_datamodel(&self) -> EngineResult<String> {
        if let Some(datamodel) = &self.config.datamodel {
            return Ok(datamodel.clone());
        }
        let path = if self.config.datamodel_path.is_absolute() {
            self.config.datamodel_path.clone()
        } else {
            self.config.cwd.join(&self.config.datamodel_path)
        };
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            self.context.initialization(
                format!("Could not read the schema at {}: {e}", path.display()),
                None,
            )
        })
    }

    async fn ensure_instance(&self) -> EngineResult<Arc<dyn QueryEngineInstance>> {
        let existing = self.instance.lock().clone();
        if let Some(instance) = existing {
            return Ok(instance);
        }

        let library = self.ensure_library()?;
        let datamodel = self.read_datamodel().await?;
        let options = InstanceOptions::from_config(&self.config, datamodel, std::env::vars());
        let instance = library
            .new_instance(&options, self.bridge.callback())
            .map_err(|e| self.initialization_error(e))?;

        *self.instance.lock() = Some(instance.clone());
        debug!(engine_id = %self.id, "created library instance");
        Ok(instance)
    }

    fn current_instance(&self) -> EngineResult<Arc<dyn QueryEngineInstance>> {
        self.instance.lock().clone().ok_or(EngineError::NotConnected)
    }

    /// Initialization errors carry `{message, error_code}` when structured
    fn initialization_error(&self, error: NativeError) -> EngineError {
        match serde_json::from_str::<Value>(&error.message) {
            Ok(value) if value.get("message").is_some() => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                let error_code = value
                    .get("error_code")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.context.initialization(message, error_code)
            }
            _ => self.context.initialization(error.message, None),
        }
    }

    /// Request errors carry `{message, backtrace}` when structured
    fn request_error(&self, error: NativeError) -> EngineError {
        if error.is_panic() {
            self.on_panic(&error.message);
            return self.context.panic(&error.message);
        }

        match serde_json::from_str::<Value>(&error.message) {
            Ok(value) => match value.get("message").and_then(Value::as_str) {
                Some(message) => {
                    let backtrace = value
                        .get("backtrace")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    self.context
                        .unknown(format!("{message}\n{backtrace}").trim_end().to_string())
                }
                None => self.context.unknown(error.message),
            },
            Err(_) => self.context.unknown(error.message),
        }
    }

    /// The instance is unusable after a panic; the next request creates a new one
    fn on_panic(&self, message: &str) {
        self.instance.lock().take();
        if self.state() == EngineState::Running {
            let _ = self.transition(LifecycleEvent::crash(message.to_string()));
        }
        let generation = self.start_generation.load(Ordering::SeqCst);
        self.clear_start_slot(generation);
        error!(engine_id = %self.id, message = %message, "💥 Query engine library panicked");
        self.events.publish(EngineEvent::new(
            EngineEventLevel::Error,
            message.to_string(),
            "query_engine",
        ));
    }

    fn parse_reply(&self, text: &str) -> EngineResult<Value> {
        serde_json::from_str(text).map_err(|e| {
            self.context
                .unknown(format!("Query engine library returned invalid JSON ({e}): {text}"))
        })
    }

    fn shutdown_error(&self) -> Option<EngineError> {
        self.received_signal.lock().as_ref().map(|signal| {
            self.context.unknown(format!(
                "The host process already received a {signal} signal and the query engine was \
                 disconnected. No further requests are possible."
            ))
        })
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
        let result = self.connect().await;
        match &result {
            Ok(()) => {
                if self.state() == EngineState::Starting {
                    self.transition(LifecycleEvent::Ready)?;
                    info!(engine_id = %self.id, "✅ Query engine library connected");
                }
            }
            Err(err) => {
                log_engine_error(&self.id, "start", err.kind(), &err.to_string());
                self.clear_start_slot(generation);
                if self.state() == EngineState::Starting {
                    let _ = self.transition(LifecycleEvent::start_failed(err.to_string()));
                }
            }
        }
        result
    }

    async fn connect(&self) -> EngineResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state().is_crashed() && lifecycle.restart_budget_exhausted() {
                lifecycle.record_refused_start();
                return Err(EngineError::EngineStuck);
            }
            lifecycle.transition(LifecycleEvent::Start)?;
        }
        self.bridge.clear();

        let instance = self.ensure_instance().await?;
        instance
            .call(NativeMethod::Connect, json!({ "headers": RequestHeaders::default() }))
            .await
            .map_err(|e| self.initialization_error(e))?;
        Ok(())
    }

    async fn call_attempt(
        self: &Arc<Self>,
        method: NativeMethod,
        args: Value,
    ) -> EngineResult<Value> {
        if let Some(err) = self.shutdown_error() {
            return Err(err);
        }
        if let Some(panic) = self.bridge.take_panic() {
            self.on_panic(&panic.message);
            return Err(self.context.from_rust_error(&panic));
        }
        self.start().await?;

        let instance = self.current_instance()?;
        let text = instance
            .call(method, args)
            .await
            .map_err(|e| self.request_error(e))?;
        self.parse_reply(&text)
    }

    fn record_success(&self) {
        self.lifecycle.lock().record_successful_request();
    }
}

impl AsyncErrorSource for LibraryEngineInner {
    fn take_async_error(&self) -> Option<EngineError> {
        self.bridge
            .take_error()
            .map(|error| self.context.from_rust_error(&error))
    }

    fn restart_budget_exceeded(&self) -> bool {
        self.lifecycle.lock().restart_budget_exceeded()
    }
}

#[async_trait]
impl ShutdownTarget for LibraryEngineInner {
    async fn shutdown(&self, signal: Option<&str>) {
        if let Some(signal) = signal {
            *self.received_signal.lock() = Some(signal.to_string());
        }
        let instance = self.instance.lock().clone();
        if let Some(instance) = instance {
            if let Err(e) = instance
                .call(NativeMethod::Disconnect, json!({ "headers": RequestHeaders::default() }))
                .await
            {
                debug!(engine_id = %self.id, error = %e, "disconnect during shutdown failed");
            }
        }
    }
}

#[async_trait]
impl Engine for LibraryEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Library
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

        if inner.lifecycle.lock().can_transition(&LifecycleEvent::Stop) {
            inner.transition(LifecycleEvent::Stop)?;
        }
        if let Some(pending) = pending {
            if let Err(err) = pending.await {
                debug!(engine_id = %inner.id, error = %err, "start failed while stopping");
            }
            // A start that had not run yet when the stop began may have completed.
            if inner.lifecycle.lock().can_transition(&LifecycleEvent::Stop) {
                inner.transition(LifecycleEvent::Stop)?;
            }
        }

        let _no_requests = inner.in_flight.write().await;
        let instance = inner.instance.lock().clone();
        if let Some(instance) = instance {
            if let Err(e) = instance
                .call(NativeMethod::Disconnect, json!({ "headers": RequestHeaders::default() }))
                .await
            {
                warn!(engine_id = %inner.id, error = %e, "query engine library failed to disconnect");
            }
        }
        inner.start_slot.lock().take();

        if inner.state() == EngineState::Stopping {
            inner.transition(LifecycleEvent::Stopped)?;
        }
        if inner.state() == EngineState::Stopped {
            inner.transition(LifecycleEvent::Reset)?;
        }
        info!(engine_id = %inner.id, "🛑 Query engine library disconnected");
        Ok(())
    }

    async fn request(&self, query: &str, options: RequestOptions) -> EngineResult<QueryResult> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;
        let args = json!({
            "body": protocol::query_body(query),
            "headers": options.headers,
            "txId": options.headers.transaction_id,
        });

        let result = run_with_retries(&inner.policy, options.is_write, inner.as_ref(), |num_try| {
            let args = args.clone();
            async move {
                debug!(engine_id = %inner.id, num_try = num_try, "library request");
                let reply = inner.call_attempt(NativeMethod::Query, args).await?;
                protocol::parse_query_response(reply, None, &inner.context)
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
        let args = json!({
            "body": protocol::batch_body(&batch),
            "headers": batch.headers,
            "txId": batch.headers.transaction_id,
        });

        let result = run_with_retries(&inner.policy, batch.contains_write, inner.as_ref(), |_| {
            let args = args.clone();
            async move {
                let reply = inner.call_attempt(NativeMethod::Query, args).await?;
                protocol::parse_batch_response(reply, None, &inner.context)
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
            let reply = inner
                .call_attempt(request.native_method(), request.native_args(&headers))
                .await?;
            request.interpret(reply, &inner.context)
        };

        match attempt.await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_known_request() => Err(err),
            Err(err) => Err(inner.take_async_error().unwrap_or(err)),
        }
    }

    async fn metrics(&self, options: MetricsOptions) -> EngineResult<Metrics> {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.read().await;
        if let Some(err) = inner.shutdown_error() {
            return Err(err);
        }
        inner.start().await?;

        let args = json!({
            "options": { "format": options.format.as_str(), "globalLabels": options.global_labels },
        });
        let text = inner
            .current_instance()?
            .call(NativeMethod::Metrics, args)
            .await
            .map_err(|e| inner.request_error(e))?;

        match options.format {
            MetricsFormat::Json => Ok(Metrics::Json(inner.parse_reply(&text)?)),
            MetricsFormat::Prometheus => Ok(Metrics::Prometheus(text)),
        }
    }

    async fn version(&self) -> EngineResult<String> {
        let library = self.inner.ensure_library()?;
        let version = library
            .version()
            .map_err(|e| self.inner.initialization_error(e))?;
        Ok(version.commit)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}
