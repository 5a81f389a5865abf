//! Application Configuration Module
//!
//! This module centralizes the configuration for the walkie service.
//! It loads settings from environment variables and provides a single,
//! shareable struct that can be passed throughout the application.

use crate::weather::{DEFAULT_LOCATION, Units};
use openai_realtime::types::audio::Voice;
use secrecy::SecretString;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use walkie_core::OrchestratorConfig;

// --- Application Constants ---

/// The size of each audio chunk sent from the microphone input stream.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// The size of each audio chunk for the audio output stream.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;
/// The latency for the output audio buffer in milliseconds.
pub const OUTPUT_LATENCY_MS: usize = 1000;

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant";
pub const DEFAULT_GPIO_PIN: u32 = 17;
/// How long the button line must stay put before a press counts.
pub const GPIO_BOUNCE: Duration = Duration::from_millis(100);

/// Where toggle and confirm commands come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TriggerKind {
    /// A push button on a sysfs GPIO line.
    Gpio,
    /// Enter on stdin toggles, "c" confirms.
    Keyboard,
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gpio" => Ok(TriggerKind::Gpio),
            "keyboard" => Ok(TriggerKind::Keyboard),
            _ => Err("expected gpio or keyboard".to_string()),
        }
    }
}

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: SecretString,
    pub model: Option<String>,
    pub voice: Voice,
    pub instructions: String,
    pub trigger: TriggerKind,
    pub gpio_pin: u32,
    pub orchestrator: OrchestratorConfig,
    pub weather_api_key: Option<SecretString>,
    pub default_location: (f64, f64),
    pub units: Units,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(name: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_location(value: &str) -> Result<(f64, f64), ConfigError> {
    let name = "WALKIE_DEFAULT_LOCATION";
    let (lat, lon) = value
        .split_once(',')
        .ok_or_else(|| invalid(name, value, "expected \"lat,lon\""))?;
    let lat: f64 = lat.trim().parse().map_err(|e| invalid(name, value, e))?;
    let lon: f64 = lon.trim().parse().map_err(|e| invalid(name, value, e))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(invalid(name, value, "coordinates out of range"));
    }
    Ok((lat, lon))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `OPENAI_API_KEY`: Your secret key for the OpenAI API. Required.
    // *   `WALKIE_MODEL`: (Optional) The realtime model. Defaults to the client's model.
    // *   `WALKIE_VOICE`: (Optional) The assistant voice. Defaults to "alloy".
    // *   `WALKIE_INSTRUCTIONS`: (Optional) The system instructions for the session.
    // *   `WALKIE_TRIGGER`: (Optional) "gpio" or "keyboard". Defaults to "gpio".
    // *   `WALKIE_GPIO_PIN`: (Optional) The button's GPIO line. Defaults to 17.
    // *   `WALKIE_STARTUP_GRACE_MS`, `WALKIE_DEBOUNCE_MS`, `WALKIE_TOOL_TIMEOUT_MS`,
    //     `WALKIE_RESPONSE_TIMEOUT_MS` (0 disables), `WALKIE_SHUTDOWN_TIMEOUT_MS`: (Optional) session timings.
    // *   `OPENWEATHERMAP_API_KEY`: (Optional) Enables the weather tool.
    // *   `WALKIE_DEFAULT_LOCATION`: (Optional) "lat,lon" used when no location is asked for.
    // *   `WALKIE_UNITS`: (Optional) "F", "C" or "K". Defaults to "F".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let millis = |name: &'static str| -> Result<Option<Duration>, ConfigError> {
            var(name)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|e| invalid(name, &v, e))
                })
                .transpose()
        };

        let openai_api_key = var("OPENAI_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let voice = match var("WALKIE_VOICE") {
            Some(v) => {
                let Ok(voice) = Voice::from_str(v.trim());
                voice
            }
            None => Voice::Alloy,
        };

        let trigger = match var("WALKIE_TRIGGER") {
            Some(v) => v
                .parse::<TriggerKind>()
                .map_err(|e| invalid("WALKIE_TRIGGER", &v, e))?,
            None => TriggerKind::Gpio,
        };

        let gpio_pin = match var("WALKIE_GPIO_PIN") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .map_err(|e| invalid("WALKIE_GPIO_PIN", &v, e))?,
            None => DEFAULT_GPIO_PIN,
        };

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            startup_grace: millis("WALKIE_STARTUP_GRACE_MS")?.unwrap_or(defaults.startup_grace),
            debounce: millis("WALKIE_DEBOUNCE_MS")?.unwrap_or(defaults.debounce),
            shutdown_timeout: millis("WALKIE_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
            tool_timeout: millis("WALKIE_TOOL_TIMEOUT_MS")?.unwrap_or(defaults.tool_timeout),
            response_timeout: match millis("WALKIE_RESPONSE_TIMEOUT_MS")? {
                Some(Duration::ZERO) => None,
                Some(timeout) => Some(timeout),
                None => defaults.response_timeout,
            },
        };

        let default_location = match var("WALKIE_DEFAULT_LOCATION") {
            Some(v) => parse_location(&v)?,
            None => DEFAULT_LOCATION,
        };

        let units = match var("WALKIE_UNITS") {
            Some(v) => v
                .parse::<Units>()
                .map_err(|e| invalid("WALKIE_UNITS", &v, e))?,
            None => Units::Fahrenheit,
        };

        // Configure logging level from RUST_LOG, with a sensible default.
        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            openai_api_key,
            model: var("WALKIE_MODEL"),
            voice,
            instructions: var("WALKIE_INSTRUCTIONS")
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            trigger,
            gpio_pin,
            orchestrator,
            weather_api_key: var("OPENWEATHERMAP_API_KEY").map(SecretString::from),
            default_location,
            units,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.openai_api_key.expose_secret(), "sk-test");
        assert_eq!(config.voice, Voice::Alloy);
        assert_eq!(config.instructions, DEFAULT_INSTRUCTIONS);
        assert_eq!(config.trigger, TriggerKind::Gpio);
        assert_eq!(config.gpio_pin, 17);
        assert_eq!(config.default_location, DEFAULT_LOCATION);
        assert_eq!(config.units, Units::Fahrenheit);
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.weather_api_key.is_none());
        assert!(config.model.is_none());
        assert_eq!(
            config.orchestrator.debounce,
            OrchestratorConfig::default().debounce
        );
    }

    #[test]
    fn test_missing_api_key() {
        let err = load(&[("WALKIE_TRIGGER", "keyboard")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "OPENAI_API_KEY"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("WALKIE_VOICE", "verse"),
            ("WALKIE_TRIGGER", "Keyboard"),
            ("WALKIE_GPIO_PIN", "27"),
            ("WALKIE_DEBOUNCE_MS", "50"),
            ("WALKIE_RESPONSE_TIMEOUT_MS", "0"),
            ("WALKIE_DEFAULT_LOCATION", "59.91, 10.75"),
            ("WALKIE_UNITS", "c"),
            ("OPENWEATHERMAP_API_KEY", "owm"),
            ("RUST_LOG", "debug"),
        ])
        .unwrap();
        assert_eq!(config.voice, Voice::Verse);
        assert_eq!(config.trigger, TriggerKind::Keyboard);
        assert_eq!(config.gpio_pin, 27);
        assert_eq!(config.orchestrator.debounce, Duration::from_millis(50));
        assert_eq!(config.orchestrator.response_timeout, None);
        assert_eq!(config.default_location, (59.91, 10.75));
        assert_eq!(config.units, Units::Celsius);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.weather_api_key.is_some());
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("OPENAI_API_KEY", "k"), ("WALKIE_GPIO_PIN", "seventeen")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "WALKIE_GPIO_PIN", .. }));

        let err = load(&[("OPENAI_API_KEY", "k"), ("WALKIE_DEFAULT_LOCATION", "91,0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "WALKIE_DEFAULT_LOCATION", .. }));

        let err = load(&[("OPENAI_API_KEY", "k"), ("RUST_LOG", "loud")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLogLevel(_)));
    }
}
