use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing is running and no start is in flight
    #[default]
    NotStarted,
    /// A start is in flight
    Starting,
    /// The engine accepts requests
    Running,
    /// A stop is tearing the transport down
    Stopping,
    /// Transport released; becomes `NotStarted` once the stop completes
    Stopped,
    /// The engine exited or failed to start
    Crashed,
}

impl EngineState {
    /// Whether a transport may be open in this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self, Self::Crashed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

impl std::str::FromStr for EngineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "crashed" => Ok(Self::Crashed),
            _ => Err(format!("Invalid engine state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            EngineState::NotStarted,
            EngineState::Starting,
            EngineState::Running,
            EngineState::Stopping,
            EngineState::Stopped,
            EngineState::Crashed,
        ] {
            assert_eq!(state.to_string().parse::<EngineState>().unwrap(), state);
        }
        assert!("paused".parse::<EngineState>().is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(EngineState::Starting.is_active());
        assert!(EngineState::Running.is_active());
        assert!(!EngineState::Stopped.is_active());
        assert!(!EngineState::Crashed.is_active());
        assert_eq!(EngineState::default(), EngineState::NotStarted);
    }
}
