use serde::{Deserialize, Serialize};

/// Events that drive engine lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    /// A start attempt begins
    Start,
    /// The engine completed its startup handshake
    Ready,
    /// The start attempt failed
    StartFailed(String),
    /// A stop was requested
    Stop,
    /// The transport has been released
    Stopped,
    /// The engine exited unexpectedly
    Crash(String),
    /// Return to the initial state after a stop
    Reset,
}

impl LifecycleEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Ready => "ready",
            Self::StartFailed(_) => "start_failed",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
            Self::Crash(_) => "crash",
            Self::Reset => "reset",
        }
    }

    /// Extract the failure reason for failure events
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::StartFailed(msg) | Self::Crash(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn crash(reason: impl Into<String>) -> Self {
        Self::Crash(reason.into())
    }

    pub fn start_failed(reason: impl Into<String>) -> Self {
        Self::StartFailed(reason.into())
    }
}
