use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};

use varme_core::config::{HubOptions, HvacOptions};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub hass_options: HubOptions,
    pub hvac_options: HvacOptions,
    #[serde(default)]
    pub admin: AdminOptions,
}

/// Loopback endpoint serving the `status` and `trigger` subcommands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AdminOptions {
    #[serde(default = "default_admin_bind")]
    pub bind: SocketAddr,
}

impl Default for AdminOptions {
    fn default() -> Self {
        Self { bind: default_admin_bind() }
    }
}

fn default_admin_bind() -> SocketAddr {
    ([127, 0, 0, 1], 8126).into()
}

impl Config {
    /// Load and validate the YAML configuration. `HASS_TOKEN` in the
    /// environment wins over the token in the file.
    pub fn load(path: &Path) -> Result<Self> {
        dotenv().ok();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        if let Ok(token) = std::env::var("HASS_TOKEN") {
            cfg.hass_options.access_token = token;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use varme_core::config::SystemMode;

    const SAMPLE: &str = r#"
hass_options:
  ws_url: ws://hub.local:8123/api/websocket
  access_token: file-token
hvac_options:
  temp_sensor: sensor.hall_temperature
  system_mode: lukewarm
  entities:
    - entity_id: climate.hall_heat_pump
      enabled: true
      defrost_capable: true
    - entity_id: climate.guest_room_ac
  heating:
    setpoint_c: 21.0
    preset_mode: comfort
    thresholds:
      indoor_min: 19.7
      indoor_max: 22.0
      outdoor_min: -10.0
      outdoor_max: 15.0
    defrost:
      temperature_threshold_c: 0.0
      period_seconds: 7200
      duration_seconds: 300
  cooling:
    setpoint_c: 24.0
    preset_mode: eco
    thresholds:
      indoor_min: 21.0
      indoor_max: 25.0
      outdoor_min: 10.0
      outdoor_max: 45.0
  active_hours:
    start: 8
    start_weekday: 7
    end_hour: 22
"#;

    fn write_sample() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write sample");
        file
    }

    #[test]
    fn loads_yaml_applies_defaults_and_env_override() {
        let file = write_sample();

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.hass_options.access_token, "file-token");
        assert_eq!(cfg.hass_options.max_retries, 5);
        assert_eq!(cfg.hass_options.retry_delay_ms, 1000);
        assert_eq!(cfg.hass_options.state_check_interval_ms, 600_000);
        assert_eq!(cfg.admin.bind, "127.0.0.1:8126".parse().expect("addr"));

        // unknown system_mode falls back to auto
        assert_eq!(cfg.hvac_options.system_mode, SystemMode::Auto);
        // missing entity flags default to false
        assert!(!cfg.hvac_options.entities[1].enabled);
        assert!(!cfg.hvac_options.entities[1].defrost_capable);

        // the environment wins over the file
        unsafe { std::env::set_var("HASS_TOKEN", "env-token") };
        let cfg = Config::load(file.path()).expect("load with env");
        assert_eq!(cfg.hass_options.access_token, "env-token");
        unsafe { std::env::remove_var("HASS_TOKEN") };
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/varmed.yaml")).expect_err("no such file");
        assert!(err.to_string().contains("reading configuration"));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"hass_options: [not, a, mapping]").expect("write");
        let err = Config::load(file.path()).expect_err("bad yaml");
        assert!(err.to_string().contains("parsing configuration"));
    }
}
