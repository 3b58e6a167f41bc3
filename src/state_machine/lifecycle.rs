use super::{
    errors::{StateMachineError, StateMachineResult},
    events::LifecycleEvent,
    states::EngineState,
};
use crate::logging::log_engine_transition;
use chrono::{DateTime, Utc};

/// Lifecycle of one engine plus its restart budget.
///
/// The budget counts starts since the last successful request. A crashed engine
/// may only be restarted while the count is below `max_starts`; an explicit
/// stop followed by `Reset` clears it.
#[derive(Debug, Clone)]
pub struct EngineLifecycle {
    engine_id: String,
    engine_type: &'static str,
    state: EngineState,
    start_count: u32,
    max_starts: u32,
    last_transition_at: DateTime<Utc>,
}

impl EngineLifecycle {
    pub fn new(engine_id: impl Into<String>, engine_type: &'static str, max_starts: u32) -> Self {
        Self {
            engine_id: engine_id.into(),
            engine_type,
            state: EngineState::NotStarted,
            start_count: 0,
            max_starts,
            last_transition_at: Utc::now(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn start_count(&self) -> u32 {
        self.start_count
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// No further automatic restarts are allowed
    pub fn restart_budget_exhausted(&self) -> bool {
        self.start_count >= self.max_starts
    }

    /// A start was attempted after the budget ran out
    pub fn restart_budget_exceeded(&self) -> bool {
        self.start_count > self.max_starts
    }

    /// Count a start that was refused because the budget is exhausted
    pub fn record_refused_start(&mut self) {
        self.start_count = self.start_count.saturating_add(1);
    }

    /// A request succeeded; the engine is healthy again
    pub fn record_successful_request(&mut self) {
        self.start_count = 0;
    }

    /// Apply an event, returning the new state
    pub fn transition(&mut self, event: LifecycleEvent) -> StateMachineResult<EngineState> {
        let from = self.state;
        let target = Self::determine_target_state(from, &event, self.restart_budget_exhausted())?;

        match event {
            LifecycleEvent::Start => self.start_count += 1,
            LifecycleEvent::Reset => self.start_count = 0,
            _ => {}
        }

        self.state = target;
        self.last_transition_at = Utc::now();

        log_engine_transition(
            &self.engine_id,
            self.engine_type,
            &from.to_string(),
            &target.to_string(),
            event.event_type(),
        );
        if let Some(reason) = event.error_message() {
            tracing::warn!(engine_id = %self.engine_id, reason = %reason, "engine lifecycle failure");
        }

        Ok(target)
    }

    /// Whether `event` is accepted in the current state
    pub fn can_transition(&self, event: &LifecycleEvent) -> bool {
        Self::determine_target_state(self.state, event, self.restart_budget_exhausted()).is_ok()
    }

    fn determine_target_state(
        current_state: EngineState,
        event: &LifecycleEvent,
        budget_exhausted: bool,
    ) -> StateMachineResult<EngineState> {
        let target = match (current_state, event) {
            // Start transitions
            (EngineState::NotStarted, LifecycleEvent::Start) => EngineState::Starting,
            (EngineState::Stopped, LifecycleEvent::Start) => EngineState::Starting,
            (EngineState::Crashed, LifecycleEvent::Start) if !budget_exhausted => {
                EngineState::Starting
            }
            (EngineState::Starting, LifecycleEvent::Ready) => EngineState::Running,

            // Failure transitions
            (EngineState::Starting, LifecycleEvent::StartFailed(_)) => EngineState::Crashed,
            (EngineState::Starting, LifecycleEvent::Crash(_)) => EngineState::Crashed,
            (EngineState::Running, LifecycleEvent::Crash(_)) => EngineState::Crashed,

            // Stop transitions
            (EngineState::Starting, LifecycleEvent::Stop) => EngineState::Stopping,
            (EngineState::Running, LifecycleEvent::Stop) => EngineState::Stopping,
            (EngineState::Crashed, LifecycleEvent::Stop) => EngineState::Stopping,
            (EngineState::Stopping, LifecycleEvent::Stopped) => EngineState::Stopped,
            (EngineState::Stopped, LifecycleEvent::Reset) => EngineState::NotStarted,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(max_starts: u32) -> EngineLifecycle {
        EngineLifecycle::new("engine-test", "test", max_starts)
    }

    #[test]
    fn test_happy_path() {
        let mut machine = lifecycle(2);
        assert_eq!(machine.transition(LifecycleEvent::Start).unwrap(), EngineState::Starting);
        assert_eq!(machine.transition(LifecycleEvent::Ready).unwrap(), EngineState::Running);
        assert_eq!(machine.transition(LifecycleEvent::Stop).unwrap(), EngineState::Stopping);
        assert_eq!(machine.transition(LifecycleEvent::Stopped).unwrap(), EngineState::Stopped);
        assert_eq!(machine.transition(LifecycleEvent::Reset).unwrap(), EngineState::NotStarted);
        assert_eq!(machine.start_count(), 0);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = lifecycle(2);
        let err = machine.transition(LifecycleEvent::Ready).unwrap_err();
        assert_eq!(
            err,
            StateMachineError::InvalidTransition {
                from: "not_started".to_string(),
                event: "ready".to_string(),
            }
        );
        assert!(!machine.can_transition(&LifecycleEvent::Stop));

        machine.transition(LifecycleEvent::Start).unwrap();
        assert!(machine.transition(LifecycleEvent::Start).is_err());
        assert_eq!(machine.state(), EngineState::Starting);
    }

    #[test]
    fn test_restart_budget() {
        let mut machine = lifecycle(2);
        machine.transition(LifecycleEvent::Start).unwrap();
        machine.transition(LifecycleEvent::Ready).unwrap();
        machine.transition(LifecycleEvent::crash("exit code 1")).unwrap();
        assert!(!machine.restart_budget_exhausted());

        machine.transition(LifecycleEvent::Start).unwrap();
        machine.transition(LifecycleEvent::start_failed("exit code 1")).unwrap();
        assert_eq!(machine.state(), EngineState::Crashed);
        assert!(machine.restart_budget_exhausted());
        assert!(machine.transition(LifecycleEvent::Start).is_err());

        machine.record_successful_request();
        assert!(machine.can_transition(&LifecycleEvent::Start));
    }

    #[test]
    fn test_budget_exceeded_only_after_a_refused_start() {
        let mut machine = lifecycle(1);
        machine.transition(LifecycleEvent::Start).unwrap();
        machine.transition(LifecycleEvent::Ready).unwrap();
        assert!(machine.restart_budget_exhausted());
        assert!(!machine.restart_budget_exceeded());

        machine.transition(LifecycleEvent::crash("killed")).unwrap();
        assert!(machine.transition(LifecycleEvent::Start).is_err());
        machine.record_refused_start();
        assert!(machine.restart_budget_exceeded());
        assert_eq!(machine.state(), EngineState::Crashed);
    }

    #[test]
    fn test_single_start_budget_in_no_retry_mode() {
        let mut machine = lifecycle(1);
        machine.transition(LifecycleEvent::Start).unwrap();
        machine.transition(LifecycleEvent::crash("killed")).unwrap();
        assert!(machine.restart_budget_exhausted());

        machine.transition(LifecycleEvent::Stop).unwrap();
        machine.transition(LifecycleEvent::Stopped).unwrap();
        machine.transition(LifecycleEvent::Reset).unwrap();
        assert!(machine.can_transition(&LifecycleEvent::Start));
    }
}
