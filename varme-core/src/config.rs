use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Connection options for the hub's WebSocket API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubOptions {
    pub ws_url: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_state_check_interval_ms")]
    pub state_check_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_state_check_interval_ms() -> u64 {
    600_000
}

impl HubOptions {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn state_check_interval(&self) -> Duration {
        Duration::from_millis(self.state_check_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    HeatOnly,
    CoolOnly,
    Auto,
    Off,
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::Auto
    }
}

// Unrecognized mode strings fall back to auto instead of failing the load.
impl<'de> Deserialize<'de> for SystemMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "heat_only" => SystemMode::HeatOnly,
            "cool_only" => SystemMode::CoolOnly,
            "off" => SystemMode::Off,
            "auto" => SystemMode::Auto,
            other => {
                tracing::warn!(mode = other, "unknown system_mode, falling back to auto");
                SystemMode::Auto
            }
        })
    }
}

/// A climate device the controller drives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub entity_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub defrost_capable: bool,
}

/// Temperature bounds gating a mode, all in °C.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub indoor_min: f64,
    pub indoor_max: f64,
    pub outdoor_min: f64,
    pub outdoor_max: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DefrostParams {
    pub temperature_threshold_c: f64,
    pub period_seconds: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeatingParams {
    pub setpoint_c: f64,
    pub preset_mode: String,
    pub thresholds: Thresholds,
    pub defrost: DefrostParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoolingParams {
    pub setpoint_c: f64,
    pub preset_mode: String,
    pub thresholds: Thresholds,
}

/// Wall-clock window during which the controller may command heating or
/// cooling. Weekdays start at `start_weekday`, weekends at `start`; both
/// endpoints are inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ActiveHours {
    pub start: u8,
    pub start_weekday: u8,
    pub end_hour: u8,
}

impl ActiveHours {
    pub fn start_for(&self, is_weekday: bool) -> u8 {
        if is_weekday { self.start_weekday } else { self.start }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HvacOptions {
    pub temp_sensor: String,
    #[serde(default)]
    pub system_mode: SystemMode,
    pub entities: Vec<Entity>,
    pub heating: HeatingParams,
    pub cooling: CoolingParams,
    pub active_hours: ActiveHours,
}

impl HvacOptions {
    pub fn enabled_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| e.enabled)
    }
}
