// State machine module for flow, hunt and cron run lifecycles
//
// Transition tables are pure functions over the persisted status enums so the
// flow runner and hunt coordinator can validate a transition before committing
// it through the store.

pub mod errors;
pub mod events;
pub mod flow_state_machine;
pub mod hunt_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{FlowEvent, HuntEvent};
pub use states::{CronJobRunStatus, FlowStatus, HuntState};
