//! # Engine Registry
//!
//! Process-wide list of live engines. Used for the "too many engines"
//! diagnostic and to tear every engine down when the host process receives a
//! termination signal. Engines register on construction and unregister on drop;
//! the registry only holds weak references.

use crate::constants::limits;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};
use tracing::{info, warn};

/// Engine-side hook invoked on process shutdown
#[async_trait]
pub trait ShutdownTarget: Send + Sync {
    /// Release the engine. `signal` names the signal the host received, if any.
    async fn shutdown(&self, signal: Option<&str>);
}

struct RegisteredEngine {
    id: String,
    target: Weak<dyn ShutdownTarget>,
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<Vec<RegisteredEngine>>,
    received_signal: Mutex<Option<String>>,
    warned_too_many: AtomicBool,
    hooks_installed: AtomicBool,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.len())
            .field("received_signal", &self.received_signal())
            .finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every engine in the process
    pub fn global() -> &'static EngineRegistry {
        GLOBAL_REGISTRY.get_or_init(EngineRegistry::new)
    }

    pub fn register(&self, id: impl Into<String>, target: Weak<dyn ShutdownTarget>) {
        let id = id.into();
        let live = {
            let mut engines = self.engines.lock();
            engines.retain(|engine| engine.target.strong_count() > 0);
            engines.push(RegisteredEngine {
                id: id.clone(),
                target,
            });
            engines.len()
        };

        if live > limits::TOO_MANY_ENGINES && !self.warned_too_many.swap(true, Ordering::SeqCst) {
            warn!(
                live_engines = live,
                "⚠️ There are already {} instances of the query engine host actively running. \
                 Create one engine per database and share it instead of creating one per request.",
                limits::TOO_MANY_ENGINES
            );
        }
        tracing::debug!(engine_id = %id, live_engines = live, "engine registered");
    }

    pub fn unregister(&self, id: &str) {
        self.engines
            .lock()
            .retain(|engine| engine.id != id && engine.target.strong_count() > 0);
    }

    /// Number of live engines
    pub fn len(&self) -> usize {
        self.engines
            .lock()
            .iter()
            .filter(|engine| engine.target.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.engines
            .lock()
            .iter()
            .any(|engine| engine.id == id && engine.target.strong_count() > 0)
    }

    /// Signal received by the host process, if shutdown was triggered by one
    pub fn received_signal(&self) -> Option<String> {
        self.received_signal.lock().clone()
    }

    /// Shut every live engine down
    pub async fn shutdown_all(&self, signal: Option<&str>) {
        if let Some(signal) = signal {
            *self.received_signal.lock() = Some(signal.to_string());
        }

        let targets: Vec<_> = self
            .engines
            .lock()
            .iter()
            .filter_map(|engine| engine.target.upgrade())
            .collect();

        info!(engines = targets.len(), signal = ?signal, "🛑 Shutting down query engines");
        futures::future::join_all(targets.iter().map(|target| target.shutdown(signal))).await;
    }

    /// Install signal handlers that shut every engine down. Returns `false` when
    /// the handlers were already installed. Must be called within a Tokio runtime.
    pub fn install_shutdown_hooks(&'static self, exit_process: bool) -> bool {
        if self.hooks_installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        tokio::spawn(async move {
            let (signal, exit_code) = wait_for_signal().await;
            self.shutdown_all(Some(signal)).await;
            if exit_process {
                if let Some(code) = exit_code {
                    std::process::exit(code);
                }
            }
        });
        true
    }
}

/// Wait for the first termination signal; returns its name and the exit code it implies
#[cfg(unix)]
async fn wait_for_signal() -> (&'static str, Option<i32>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).ok();
    let mut user2 = signal(SignalKind::user_defined2()).ok();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => ("SIGINT", Some(130)),
        _ = recv_or_pending(&mut terminate) => ("SIGTERM", Some(143)),
        _ = recv_or_pending(&mut user2) => ("SIGUSR2", None),
    }
}

#[cfg(unix)]
async fn recv_or_pending(stream: &mut Option<tokio::signal::unix::Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> (&'static str, Option<i32>) {
    let _ = tokio::signal::ctrl_c().await;
    ("SIGINT", Some(130))
}
