// Engine lifecycle state machine
//
// Tracks NotStarted -> Starting -> Running -> Stopping -> Stopped for every
// transport, with Crashed for unexpected exits and a restart budget.

pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::LifecycleEvent;
pub use lifecycle::EngineLifecycle;
pub use states::EngineState;
