use crate::metering_62056::negotiation;
use crate::metering_62056::obis_parser::validate_obis_code;
use crate::metering_62056::session::{SessionSettings, DEFAULT_OBIS_CODES, DEFAULT_PASSWORD};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "IEC2MQTT_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/iec2mqtt.yaml", "iec2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to find the config on config/iec2mqtt.yaml or iec2mqtt.yaml")]
    NotFound,
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn mqtt_client_name_default() -> String { return "iec2mqtt".to_string() }
fn mqtt_base_topic_default() -> String { return "iec2mqtt".to_string() }
fn mqtt_ha_enabled_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Sensor,
    TextSensor,
}

fn sensor_type_default() -> SensorType { return SensorType::Sensor }
fn sensor_group_default() -> u8 { return 1 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SensorConfig {
    pub name: String,
    pub obis: String,
    #[serde(rename = "type", default="sensor_type_default")]
    pub sensor_type: SensorType,
    /// Text sensors only: 0 is the whole line, 1 and 2 the bracket values
    #[serde(default="sensor_group_default")]
    pub group: u8,
    #[serde(default)]
    pub unit_of_measurement: String,
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub state_class: String,
}

fn meter_update_interval_default() -> u64 { return 60 }
fn meter_connection_timeout_default() -> u64 { return 3000 }
fn meter_max_retries_default() -> u32 { return 2 }
fn meter_retry_delay_default() -> u64 { return 15000 }
fn meter_password_default() -> String { return DEFAULT_PASSWORD.to_string() }
fn meter_loop_interval_default() -> u64 { return 10 }
fn meter_obis_codes_default() -> Vec<String> { return DEFAULT_OBIS_CODES.iter().map(|c| c.to_string()).collect() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    pub name: String,
    /// Serial device of the optical reading head
    pub port: String,
    /// Seconds between readouts, 0 means never
    #[serde(default="meter_update_interval_default")]
    pub update_interval: u64,
    #[serde(default="meter_connection_timeout_default")]
    pub connection_timeout: u64,
    #[serde(default="meter_max_retries_default")]
    pub max_retries: u32,
    #[serde(default="meter_retry_delay_default")]
    pub retry_delay: u64,
    #[serde(default)]
    pub battery_meter: bool,
    #[serde(default)]
    pub mode_d: bool,
    #[serde(default)]
    pub baud_rate_max: u32,
    #[serde(default="meter_password_default")]
    pub password: String,
    #[serde(default="meter_loop_interval_default")]
    pub loop_interval: u64,
    #[serde(default="meter_obis_codes_default")]
    pub obis_codes: Vec<String>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl MeterConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            update_interval: match self.update_interval {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            connection_timeout: Duration::from_millis(self.connection_timeout),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay),
            battery_meter: self.battery_meter,
            force_mode_d: self.mode_d,
            baud_rate_max: self.baud_rate_max,
            password: self.password.clone(),
            obis_codes: self.obis_codes.clone(),
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub meter: MeterConfig,
}

impl Config {
    /// Loads the config from `$IEC2MQTT_CONFIG` or one of the default paths.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let path = CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or(ConfigError::NotFound)?;

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        c.validate()?;
        debug!("Config for meter '{}' with {} sensors", c.meter.name, c.meter.sensors.len());
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.meter;

        if m.name.is_empty() {
            return Err(ConfigError::Invalid("meter name must not be empty".to_string()));
        }

        if m.connection_timeout == 0 {
            return Err(ConfigError::Invalid("connection_timeout must be greater than 0".to_string()));
        }

        if m.baud_rate_max != 0 && !negotiation::is_valid_baud_rate(m.baud_rate_max) {
            return Err(ConfigError::Invalid(format!(
                "baud_rate_max {} is not one of {:?}", m.baud_rate_max, negotiation::BAUD_RATES)));
        }

        if m.password.len() != 8 || m.password.contains(['(', ')']) {
            return Err(ConfigError::Invalid("password must be 8 characters without brackets".to_string()));
        }

        for code in &m.obis_codes {
            if !validate_obis_code(code) {
                return Err(ConfigError::Invalid(format!("invalid OBIS code '{code}' in obis_codes")));
            }
        }

        for s in &m.sensors {
            if !validate_obis_code(&s.obis) {
                return Err(ConfigError::Invalid(format!("invalid OBIS code '{}' for sensor '{}'", s.obis, s.name)));
            }
            if s.group > 2 {
                return Err(ConfigError::Invalid(format!("group {} of sensor '{}' must be 0, 1 or 2", s.group, s.name)));
            }
        }

        Ok(())
    }
}
