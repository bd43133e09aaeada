use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, Rng};
use std::{env, str::FromStr};
use thiserror::Error;

pub static ENV_PREFIX: Lazy<String> = Lazy::new(|| "HCRULES".to_string());

pub const CHANNEL_CAPACITY: usize = 65535;

fn env_name(name: &str) -> String {
    format!("{}_{}", *ENV_PREFIX, name)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid value [{value}] for {name}: {reason}")]
    InvalidValue { name: String, value: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub engine: EngineSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Ok(Self {
            mqtt: MqttSettings::from_env()?,
            engine: EngineSettings::from_env()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub channel_size: usize,
}

impl MqttSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let hostname = string_setting("MQTT_HOST", "localhost");
        let port = number_setting("MQTT_PORT", 1883u16)?;

        let username = string_setting("MQTT_USERNAME", String::default());
        let password = string_setting("MQTT_PASSWORD", String::default());
        let client_id = string_setting(
            "MQTT_CLIENT_ID",
            format!(
                "hcrules-{}",
                rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(8)
                    .map(char::from)
                    .collect::<String>()
            ),
        );
        let channel_size = number_setting("MQTT_CHANNEL_SIZE", CHANNEL_CAPACITY)?;

        Ok(Self {
            hostname,
            port,
            username,
            password,
            client_id,
            channel_size,
        })
    }
}

/// Settings the engine itself needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Id of the engine's own settings device, also the root of its log topics.
    pub device_id: String,
    pub device_name: String,
    /// Name of the switch that turns on debug output of rules.
    pub debug_control: String,
    /// Initial state of that switch.
    pub debug: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device_id: "wbrules".to_string(),
            device_name: "Rule Engine Settings".to_string(),
            debug_control: "Rule debugging".to_string(),
            debug: false,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();
        Ok(Self {
            device_id: string_setting("DEVICE_ID", defaults.device_id),
            device_name: string_setting("DEVICE_NAME", defaults.device_name),
            debug_control: string_setting("DEBUG_CONTROL", defaults.debug_control),
            debug: bool_setting("DEBUG", defaults.debug)?,
        })
    }
}

fn string_setting(name: &str, default: impl Into<String>) -> String {
    env::var(env_name(name)).ok().unwrap_or(default.into())
}

fn number_setting<T>(name: &str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(env_name(name)) {
        Ok(value) => value.parse::<T>().map_err(|err| SettingsError::InvalidValue {
            name: env_name(name),
            reason: err.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn bool_setting(name: &str, default: bool) -> Result<bool, SettingsError> {
    match env::var(env_name(name)) {
        Ok(value) => parse_bool(&value).ok_or_else(|| SettingsError::InvalidValue {
            name: env_name(name),
            value,
            reason: "expected one of 1, 0, true, false".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
