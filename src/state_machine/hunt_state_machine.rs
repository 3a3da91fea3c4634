use super::{
    errors::{invalid_transition, StateMachineResult},
    events::HuntEvent,
    states::HuntState,
};

/// Transition table for hunt lifecycle.
pub fn determine_target_state(current: HuntState, event: &HuntEvent) -> StateMachineResult<HuntState> {
    let target = match (current, event) {
        // Start and resume
        (HuntState::Paused, HuntEvent::Start) => HuntState::Started,

        // Pause transitions
        (HuntState::Started, HuntEvent::Pause) => HuntState::Paused,
        (HuntState::Started, HuntEvent::AutoPause(_)) => HuntState::Paused,

        // Stop transitions
        (HuntState::Started | HuntState::Paused, HuntEvent::Stop(_)) => HuntState::Stopped,

        // Completion
        (HuntState::Started | HuntState::Paused, HuntEvent::Complete) => HuntState::Completed,

        (from_state, _) => return Err(invalid_transition(from_state, event.event_type())),
    };

    Ok(target)
}
