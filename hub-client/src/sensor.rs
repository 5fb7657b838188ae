use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::warn;

use varme_core::conditions::ConditionsDelta;

use crate::client::{ClientError, HubApi};
use crate::protocol::StateChangedEvent;

/// The hub's weather-provider temperature entity, used for the outdoor
/// reading.
pub const OUTDOOR_SENSOR_ENTITY: &str = "sensor.openweathermap_temperature";

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("entity not found")]
    NotFound,
    #[error("state {0:?} is not a temperature")]
    InvalidFormat(String),
    #[error(transparent)]
    Transport(#[from] ClientError),
}

/// Read a named entity's state as a temperature in °C.
pub async fn read_temperature(hub: &dyn HubApi, entity_id: &str) -> Result<f64, SensorError> {
    let snapshot = hub.entity_state(entity_id).await?.ok_or(SensorError::NotFound)?;
    parse_temperature(&snapshot.state)
}

/// Outdoor reading from the well-known weather entity. Failure is
/// non-fatal; the caller simply evaluates without outdoor context.
pub async fn read_outdoor_temperature(hub: &dyn HubApi) -> Option<f64> {
    match read_temperature(hub, OUTDOOR_SENSOR_ENTITY).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(entity_id = OUTDOOR_SENSOR_ENTITY, %err, "outdoor temperature unavailable");
            None
        }
    }
}

/// Extract an indoor reading from a state_changed event for the configured
/// sensor. Every other event, and any state that does not parse as a float,
/// yields None.
pub fn conditions_delta(
    event: &StateChangedEvent,
    temp_sensor: &str,
    now: DateTime<Local>,
) -> Option<ConditionsDelta> {
    if event.entity_id != temp_sensor {
        return None;
    }
    let new_state = event.new_state.as_ref()?;
    let indoor_c = new_state.state.parse::<f64>().ok()?;
    Some(ConditionsDelta {
        indoor_c,
        hour: now.hour() as u8,
        is_weekday: now.weekday().number_from_monday() <= 5,
    })
}

fn parse_temperature(state: &str) -> Result<f64, SensorError> {
    state.parse::<f64>().map_err(|_| SensorError::InvalidFormat(state.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntitySnapshot;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn snapshot(entity_id: &str, state: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: BTreeMap::new(),
            last_updated: None,
        }
    }

    fn change(entity_id: &str, state: &str) -> StateChangedEvent {
        StateChangedEvent {
            entity_id: entity_id.into(),
            old_state: None,
            new_state: Some(snapshot(entity_id, state)),
        }
    }

    #[test]
    fn parses_plain_floats_only() {
        assert_eq!(parse_temperature("21.5").expect("float"), 21.5);
        assert_eq!(parse_temperature("-3").expect("float"), -3.0);
        assert!(matches!(parse_temperature("21.5 °C"), Err(SensorError::InvalidFormat(_))));
        assert!(matches!(parse_temperature("unavailable"), Err(SensorError::InvalidFormat(_))));
        assert!(matches!(parse_temperature(""), Err(SensorError::InvalidFormat(_))));
    }

    #[test]
    fn delta_for_the_configured_sensor() {
        // a Thursday morning
        let now = Local.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).single().expect("timestamp");
        let delta = conditions_delta(&change("sensor.hall_temperature", "20.4"), "sensor.hall_temperature", now)
            .expect("delta");
        assert_eq!(delta.indoor_c, 20.4);
        assert_eq!(delta.hour, 9);
        assert!(delta.is_weekday);
    }

    #[test]
    fn weekend_flag_follows_the_calendar() {
        // a Saturday
        let now = Local.with_ymd_and_hms(2026, 1, 17, 10, 0, 0).single().expect("timestamp");
        let delta = conditions_delta(&change("sensor.hall_temperature", "20.4"), "sensor.hall_temperature", now)
            .expect("delta");
        assert!(!delta.is_weekday);
    }

    #[test]
    fn other_entities_and_bad_states_are_ignored() {
        let now = Local.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).single().expect("timestamp");
        assert!(
            conditions_delta(&change("sensor.porch_temperature", "5.0"), "sensor.hall_temperature", now)
                .is_none()
        );
        assert!(
            conditions_delta(&change("sensor.hall_temperature", "unknown"), "sensor.hall_temperature", now)
                .is_none()
        );

        let removed = StateChangedEvent {
            entity_id: "sensor.hall_temperature".into(),
            old_state: Some(snapshot("sensor.hall_temperature", "20.0")),
            new_state: None,
        };
        assert!(conditions_delta(&removed, "sensor.hall_temperature", now).is_none());
    }
}
