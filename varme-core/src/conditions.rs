use serde::{Deserialize, Serialize};

/// Snapshot of everything the decision engine reads about the world.
///
/// Written only by the controller (on sensor events and periodic refreshes);
/// the state machine and decision engine treat it as read-only input.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Conditions {
    pub indoor_c: Option<f64>,
    pub outdoor_c: Option<f64>,
    pub hour: u8,
    pub is_weekday: bool,
}

impl Conditions {
    pub fn apply(&mut self, delta: ConditionsDelta) {
        self.indoor_c = Some(delta.indoor_c);
        self.hour = delta.hour;
        self.is_weekday = delta.is_weekday;
    }
}

/// Indoor reading extracted from a single state_changed event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionsDelta {
    pub indoor_c: f64,
    pub hour: u8,
    pub is_weekday: bool,
}
