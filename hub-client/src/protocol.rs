use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the client writes to the hub. After the auth phase every
/// request carries a session-scoped, strictly increasing `id`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth { access_token: String },
    SubscribeEvents { id: u64, event_type: String },
    GetStates { id: u64 },
    CallService { id: u64, domain: String, service: String, service_data: Value },
}

impl ClientMessage {
    pub fn id(&self) -> Option<u64> {
        match self {
            ClientMessage::Auth { .. } => None,
            ClientMessage::SubscribeEvents { id, .. }
            | ClientMessage::GetStates { id }
            | ClientMessage::CallService { id, .. } => Some(*id),
        }
    }
}

/// Messages the hub writes to the client. Anything with an unrecognized
/// `type` decodes as `Unknown` and is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthRequired,
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: EventPayload,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// One entity's state as reported by `get_states`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A state_changed event, already narrowed from the raw event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntitySnapshot>,
    pub new_state: Option<EntitySnapshot>,
}

impl StateChangedEvent {
    /// Narrow a raw event to a state change; anything else is None.
    pub fn from_event(event: &EventPayload) -> Option<Self> {
        if event.event_type != "state_changed" {
            return None;
        }
        let entity_id = event.data.get("entity_id")?.as_str()?.to_string();
        let old_state = event
            .data
            .get("old_state")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let new_state = event
            .data
            .get("new_state")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        Some(Self { entity_id, old_state, new_state })
    }
}
