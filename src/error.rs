//! # Engine Error Taxonomy
//!
//! Every failure surfaced to callers of an [`Engine`](crate::engine::Engine) is an
//! [`EngineError`]. The first five variants are the user-facing taxonomy; the rest
//! describe host-side conditions (not connected, stuck restart loop, worker gone).
//!
//! `EngineError` is `Clone` because a single in-flight start is shared by every
//! concurrent caller and each of them receives the same failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Transport-level failure codes raised by the HTTP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorCode {
    ConnectionReset,
    ConnectionRefused,
    Aborted,
    Destroyed,
    Socket,
    Closed,
    Other,
}

impl NetworkErrorCode {
    /// Codes that indicate the engine went away and a restart may help
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other)
    }

    /// Classify an I/O error kind
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => Self::Aborted,
            io::ErrorKind::BrokenPipe => Self::Socket,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected => Self::Closed,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionReset => write!(f, "connection_reset"),
            Self::ConnectionRefused => write!(f, "connection_refused"),
            Self::Aborted => write!(f, "aborted"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Socket => write!(f, "socket"),
            Self::Closed => write!(f, "closed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Engine host errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The engine could not be located, loaded or started
    #[error("{message}")]
    Initialization {
        message: String,
        client_version: String,
        error_code: Option<String>,
    },

    /// The engine panicked; `message` already carries the bug report link
    #[error("{message}")]
    RustPanic {
        message: String,
        client_version: String,
    },

    /// The engine rejected the request with a stable error code
    #[error("{message}")]
    KnownRequest {
        message: String,
        code: String,
        meta: Option<Value>,
        client_version: String,
    },

    /// The request failed for a reason the engine did not classify
    #[error("{message}")]
    UnknownRequest {
        message: String,
        client_version: String,
    },

    /// Transport failure between the host and the engine process
    #[error("Network error ({code}): {message}")]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    /// Restart budget exhausted and the engine never reported why
    #[error("Query engine is trying to restart, but can't. Please look into the logs or turn on the env var DEBUG=* to debug the constantly restarting query engine.")]
    EngineStuck,

    /// A request was issued against a transport that is not open
    #[error("Engine is not connected: start() must complete before requests are sent")]
    NotConnected,

    /// The worker thread hosting the engine is gone
    #[error("Engine worker exited: {reason}")]
    WorkerExited { reason: String },

    /// Lifecycle transition rejected by the state machine
    #[error("Invalid engine lifecycle transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Invalid host configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn initialization(message: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
            client_version: client_version.into(),
            error_code: None,
        }
    }

    pub fn initialization_with_code(
        message: impl Into<String>,
        client_version: impl Into<String>,
        error_code: Option<String>,
    ) -> Self {
        Self::Initialization {
            message: message.into(),
            client_version: client_version.into(),
            error_code,
        }
    }

    pub fn known(
        message: impl Into<String>,
        code: impl Into<String>,
        meta: Option<Value>,
        client_version: impl Into<String>,
    ) -> Self {
        Self::KnownRequest {
            message: message.into(),
            code: code.into(),
            meta,
            client_version: client_version.into(),
        }
    }

    pub fn unknown(message: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self::UnknownRequest {
            message: message.into(),
            client_version: client_version.into(),
        }
    }

    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self::Network {
            code,
            message: message.into(),
        }
    }

    /// Build a network error from a reqwest failure by walking its source chain
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let mut code = NetworkErrorCode::Other;
        let mut source: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(current) = source {
            if let Some(io_err) = current.downcast_ref::<io::Error>() {
                code = NetworkErrorCode::from_io_kind(io_err.kind());
                break;
            }
            source = current.source();
        }

        if code == NetworkErrorCode::Other {
            if err.is_connect() {
                code = NetworkErrorCode::ConnectionRefused;
            } else if err.is_request() || err.is_body() {
                code = NetworkErrorCode::Closed;
            }
        }

        Self::network(code, err.to_string())
    }

    pub fn is_known_request(&self) -> bool {
        matches!(self, Self::KnownRequest { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::RustPanic { .. })
    }

    /// The network code when this is a transport failure
    pub fn network_code(&self) -> Option<NetworkErrorCode> {
        match self {
            Self::Network { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a read request failing with this error may be reissued
    pub fn is_transient_network(&self) -> bool {
        self.network_code().is_some_and(|code| code.is_transient())
    }

    /// Short name of the variant, used in logs and on the worker wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "initialization",
            Self::RustPanic { .. } => "rust_panic",
            Self::KnownRequest { .. } => "known_request",
            Self::UnknownRequest { .. } => "unknown_request",
            Self::Network { .. } => "network",
            Self::EngineStuck => "engine_stuck",
            Self::NotConnected => "not_connected",
            Self::WorkerExited { .. } => "worker_exited",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<crate::state_machine::StateMachineError> for EngineError {
    fn from(err: crate::state_machine::StateMachineError) -> Self {
        match err {
            crate::state_machine::StateMachineError::InvalidTransition { from, event } => {
                Self::InvalidTransition { from, event }
            }
        }
    }
}

impl From<crate::config::ConfigurationError> for EngineError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        Self::Configuration(err.to_string())
    }
}
