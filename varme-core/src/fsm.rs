use serde::{Deserialize, Serialize};

/// Control states of the HVAC machine.
///
/// `Initial` exists only between startup and the first evaluated tick;
/// `Stopped` is terminal until the process restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    Initial,
    Idle,
    Heating,
    Cooling,
    Defrost,
    Stopped,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::Initial => "initial",
            FsmState::Idle => "idle",
            FsmState::Heating => "heating",
            FsmState::Cooling => "cooling",
            FsmState::Defrost => "defrost",
            FsmState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsmEvent {
    Initialize,
    StartHeating,
    StartCooling,
    StartDefrost,
    StopHeating,
    StopCooling,
    ResumeHeating,
    CompleteDefrost,
    Shutdown,
}

impl FsmEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmEvent::Initialize => "initialize",
            FsmEvent::StartHeating => "start_heating",
            FsmEvent::StartCooling => "start_cooling",
            FsmEvent::StartDefrost => "start_defrost",
            FsmEvent::StopHeating => "stop_heating",
            FsmEvent::StopCooling => "stop_cooling",
            FsmEvent::ResumeHeating => "resume_heating",
            FsmEvent::CompleteDefrost => "complete_defrost",
            FsmEvent::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event {event} not permitted in state {state}")]
pub struct TransitionRejected {
    pub state: FsmState,
    pub event: FsmEvent,
}

/// The transition table. Anything not listed is rejected.
pub fn transition(state: FsmState, event: FsmEvent) -> Result<FsmState, TransitionRejected> {
    use FsmEvent::*;
    use FsmState::*;

    match (state, event) {
        (Initial, Initialize) => Ok(Idle),
        (Idle, StartHeating) => Ok(Heating),
        (Idle, StartCooling) => Ok(Cooling),
        (Idle, StartDefrost) => Ok(Defrost),
        (Idle, Shutdown) | (Heating, Shutdown) | (Cooling, Shutdown) | (Defrost, Shutdown) => {
            Ok(Stopped)
        }
        (Heating, StopHeating) => Ok(Idle),
        (Heating, StartDefrost) => Ok(Defrost),
        (Cooling, StopCooling) => Ok(Idle),
        (Defrost, CompleteDefrost) => Ok(Idle),
        (Defrost, ResumeHeating) => Ok(Heating),
        _ => Err(TransitionRejected { state, event }),
    }
}
