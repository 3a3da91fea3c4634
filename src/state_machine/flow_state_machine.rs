use super::{
    errors::{invalid_transition, StateMachineResult},
    events::FlowEvent,
    states::FlowStatus,
};

/// Transition table for flow status.
///
/// Only a running flow can change status; every terminal status is final.
pub fn determine_target_state(current: FlowStatus, event: &FlowEvent) -> StateMachineResult<FlowStatus> {
    let target = match (current, event) {
        (FlowStatus::Running, FlowEvent::Complete) => FlowStatus::Succeeded,
        (FlowStatus::Running, FlowEvent::Fail(_)) => FlowStatus::Error,
        (FlowStatus::Running, FlowEvent::Crash(_)) => FlowStatus::Crashed,
        (from_state, _) => return Err(invalid_transition(from_state, event.event_type())),
    };

    Ok(target)
}
