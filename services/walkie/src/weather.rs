//! The `get_weather` tool, backed by the OpenWeatherMap API.
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::str::FromStr;
use walkie_core::error::ToolError;
use walkie_core::tools::Tool;

const GEOCODING_URL: &str = "https://api.openweathermap.org/geo/1.0/direct";
const CURRENT_URL: &str = "https://api.openweathermap.org/data/2.5/weather";
const HOURLY_URL: &str = "https://api.openweathermap.org/data/3.0/onecall";
const FIVE_DAY_URL: &str = "https://api.openweathermap.org/data/2.5/forecast";

/// Hours of the hourly forecast handed back to the assistant.
const HOURLY_LIMIT: usize = 24;

/// San Francisco.
pub const DEFAULT_LOCATION: (f64, f64) = (37.7749, -122.4194);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Fahrenheit,
    Celsius,
    Kelvin,
}

impl Units {
    pub fn symbol(self) -> &'static str {
        match self {
            Units::Fahrenheit => "F",
            Units::Celsius => "C",
            Units::Kelvin => "K",
        }
    }

    fn api_name(self) -> &'static str {
        match self {
            Units::Fahrenheit => "imperial",
            Units::Celsius => "metric",
            Units::Kelvin => "standard",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown unit {0:?}, expected F, C or K")]
pub struct UnknownUnit(String);

impl FromStr for Units {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F" => Ok(Units::Fahrenheit),
            "C" => Ok(Units::Celsius),
            "K" => Ok(Units::Kelvin),
            _ => Err(UnknownUnit(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastType {
    Current,
    Hourly,
    FiveDay,
}

impl FromStr for ForecastType {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(ForecastType::Current),
            "hourly" => Ok(ForecastType::Hourly),
            "5day" => Ok(ForecastType::FiveDay),
            other => Err(ToolError::InvalidArguments(format!(
                "invalid forecast type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct Place {
    lat: f64,
    lon: f64,
}

#[derive(Debug, serde::Deserialize)]
struct Readings {
    temp: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    humidity: f64,
}

#[derive(Debug, serde::Deserialize)]
struct Condition {
    description: String,
}

#[derive(Debug, serde::Deserialize)]
struct Wind {
    speed: f64,
}

#[derive(Debug, serde::Deserialize)]
struct CurrentResponse {
    main: Readings,
    #[serde(default)]
    weather: Vec<Condition>,
    wind: Wind,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct Hour {
    dt: i64,
    temp: f64,
    humidity: f64,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, serde::Deserialize)]
struct HourlyResponse {
    #[serde(default)]
    hourly: Vec<Hour>,
}

#[derive(Debug, serde::Deserialize)]
struct Slot {
    dt: i64,
    main: Readings,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, serde::Deserialize)]
struct FiveDayResponse {
    #[serde(default)]
    list: Vec<Slot>,
}

fn describe(conditions: &[Condition]) -> &str {
    conditions
        .first()
        .map(|c| c.description.as_str())
        .unwrap_or("unknown")
}

fn summarize_current(data: CurrentResponse, units: Units) -> Value {
    json!({
        "temperature": data.main.temp,
        "feels_like": data.main.feels_like,
        "humidity": data.main.humidity,
        "description": describe(&data.weather),
        "wind_speed": data.wind.speed,
        "location": data.name.as_deref().unwrap_or("Unknown"),
        "unit": units.symbol(),
    })
}

fn summarize_hourly(data: HourlyResponse, units: Units) -> Value {
    let hours: Vec<Value> = data
        .hourly
        .iter()
        .take(HOURLY_LIMIT)
        .map(|hour| {
            json!({
                "time": hour.dt,
                "temperature": hour.temp,
                "description": describe(&hour.weather),
                "humidity": hour.humidity,
            })
        })
        .collect();
    json!({ "hourly_forecast": hours, "unit": units.symbol() })
}

fn summarize_five_day(data: FiveDayResponse, units: Units) -> Value {
    let slots: Vec<Value> = data
        .list
        .iter()
        .map(|slot| {
            json!({
                "time": slot.dt,
                "temperature": slot.main.temp,
                "description": describe(&slot.weather),
                "humidity": slot.main.humidity,
            })
        })
        .collect();
    json!({ "daily_forecast": slots, "unit": units.symbol() })
}

fn request_error(e: reqwest::Error) -> ToolError {
    if e.is_timeout() {
        ToolError::Failed("weather request timed out".to_string())
    } else if e.is_connect() {
        ToolError::Failed("failed to connect to weather service".to_string())
    } else {
        ToolError::Failed(format!("weather request failed: {}", e))
    }
}

fn string_arg<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}

pub struct WeatherTool {
    client: reqwest::Client,
    api_key: SecretString,
    default_location: (f64, f64),
    default_units: Units,
}

impl WeatherTool {
    pub fn new(api_key: SecretString, default_location: (f64, f64), default_units: Units) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            default_location,
            default_units,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ToolError> {
        tracing::debug!("fetching {}", url);
        let response = self
            .client
            .get(url)
            .query(query)
            .query(&[("appid", self.api_key.expose_secret())])
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(ToolError::Failed(
                    "invalid OpenWeatherMap API key".to_string(),
                ));
            }
            StatusCode::NOT_FOUND => {
                return Err(ToolError::Failed("location not found".to_string()));
            }
            status if !status.is_success() => {
                return Err(ToolError::Failed(format!(
                    "weather service returned {}",
                    status
                )));
            }
            _ => {}
        }

        response.json::<T>().await.map_err(|e| {
            ToolError::Failed(format!("unexpected response from weather service: {}", e))
        })
    }

    async fn coordinates(&self, location: &str) -> Result<(f64, f64), ToolError> {
        let places: Vec<Place> = self
            .get_json(
                GEOCODING_URL,
                &[("q", location.to_string()), ("limit", "1".to_string())],
            )
            .await?;
        places
            .first()
            .map(|place| (place.lat, place.lon))
            .ok_or_else(|| {
                ToolError::Failed(format!("could not find coordinates for {}", location))
            })
    }

    async fn forecast(
        &self,
        forecast: ForecastType,
        (lat, lon): (f64, f64),
        units: Units,
    ) -> Result<Value, ToolError> {
        let mut query = vec![
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("units", units.api_name().to_string()),
        ];
        let summary = match forecast {
            ForecastType::Current => summarize_current(self.get_json(CURRENT_URL, &query).await?, units),
            ForecastType::Hourly => {
                query.push(("exclude", "current,minutely,daily,alerts".to_string()));
                summarize_hourly(self.get_json(HOURLY_URL, &query).await?, units)
            }
            ForecastType::FiveDay => {
                summarize_five_day(self.get_json(FIVE_DAY_URL, &query).await?, units)
            }
        };
        Ok(summary)
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get weather information for a location. Provide forecast_type ('current', 'hourly', or '5day') \
         and optionally a location name and unit ('F', 'C', or 'K')."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "forecast_type": {
                    "type": "string",
                    "enum": ["current", "hourly", "5day"],
                    "description": "Which forecast to fetch"
                },
                "location": {
                    "type": "string",
                    "description": "City name, e.g. 'London' or 'San Francisco, CA, US'. Defaults to the configured home location"
                },
                "unit": {
                    "type": "string",
                    "enum": ["F", "C", "K"],
                    "description": "Temperature unit"
                }
            },
            "required": ["forecast_type"]
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let forecast: ForecastType = string_arg(&arguments, "forecast_type")
            .ok_or_else(|| {
                ToolError::InvalidArguments("missing required parameter: forecast_type".to_string())
            })?
            .parse()?;
        let units = match string_arg(&arguments, "unit") {
            Some(unit) => unit
                .parse()
                .map_err(|e: UnknownUnit| ToolError::InvalidArguments(e.to_string()))?,
            None => self.default_units,
        };
        let coordinates = match string_arg(&arguments, "location").map(str::trim) {
            Some(location) if !location.is_empty() => self.coordinates(location).await?,
            _ => self.default_location,
        };

        tracing::info!(
            "weather lookup: {:?} at {:?} in {}",
            forecast,
            coordinates,
            units.symbol()
        );
        self.forecast(forecast, coordinates, units).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walkie_core::tools::validate_arguments;

    fn tool() -> WeatherTool {
        WeatherTool::new(
            SecretString::from("test_api_key".to_string()),
            DEFAULT_LOCATION,
            Units::Fahrenheit,
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_endpoints_use_tls() {
        // The API key travels in the query string.
        for url in [GEOCODING_URL, CURRENT_URL, HOURLY_URL, FIVE_DAY_URL] {
            assert!(url.starts_with("https://"), "{url}");
        }
    }

    #[test]
    fn test_units_parse() {
        assert_eq!("f".parse::<Units>().unwrap(), Units::Fahrenheit);
        assert_eq!(" C ".parse::<Units>().unwrap(), Units::Celsius);
        assert_eq!("K".parse::<Units>().unwrap(), Units::Kelvin);
        assert!("R".parse::<Units>().is_err());
        assert_eq!(Units::Kelvin.api_name(), "standard");
    }

    #[test]
    fn test_schema_accepts_documented_arguments() {
        let schema = tool().parameters();
        assert!(validate_arguments(&schema, &args(json!({"forecast_type": "current"}))).is_ok());
        assert!(
            validate_arguments(
                &schema,
                &args(json!({"forecast_type": "5day", "location": "Chicago, IL, US", "unit": "C"}))
            )
            .is_ok()
        );
        assert!(validate_arguments(&schema, &args(json!({"location": "Paris"}))).is_err());
        assert!(validate_arguments(&schema, &args(json!({"forecast_type": "weekly"}))).is_err());
    }

    #[tokio::test]
    async fn test_invalid_forecast_type_fails_before_any_request() {
        let err = tool()
            .execute(args(json!({"forecast_type": "invalid"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid forecast type: invalid");
    }

    #[tokio::test]
    async fn test_invalid_unit_is_rejected() {
        let err = tool()
            .execute(args(json!({"forecast_type": "current", "unit": "X"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_summarize_current() {
        let data: CurrentResponse = serde_json::from_value(json!({
            "coord": {"lon": -122.4194, "lat": 37.7749},
            "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
            "main": {"temp": 72.5, "feels_like": 71.8, "temp_min": 65.3, "temp_max": 77.2, "pressure": 1012, "humidity": 64},
            "wind": {"speed": 8.05, "deg": 300},
            "name": "San Francisco"
        }))
        .unwrap();

        let summary = summarize_current(data, Units::Celsius);
        assert_eq!(summary["temperature"], json!(72.5));
        assert_eq!(summary["feels_like"], json!(71.8));
        assert_eq!(summary["description"], json!("clear sky"));
        assert_eq!(summary["wind_speed"], json!(8.05));
        assert_eq!(summary["location"], json!("San Francisco"));
        assert_eq!(summary["unit"], json!("C"));
    }

    #[test]
    fn test_summarize_hourly_keeps_first_day() {
        let hours: Vec<Value> = (0..48)
            .map(|i| {
                json!({
                    "dt": 1618317040 + i * 3600,
                    "temp": 60.0 + i as f64,
                    "humidity": 50,
                    "weather": [{"description": "few clouds"}]
                })
            })
            .collect();
        let data: HourlyResponse = serde_json::from_value(json!({ "hourly": hours })).unwrap();

        let summary = summarize_hourly(data, Units::Fahrenheit);
        let forecast = summary["hourly_forecast"].as_array().unwrap();
        assert_eq!(forecast.len(), HOURLY_LIMIT);
        assert_eq!(forecast[0]["time"], json!(1618317040));
        assert_eq!(forecast[0]["description"], json!("few clouds"));
        assert_eq!(summary["unit"], json!("F"));
    }

    #[test]
    fn test_summarize_five_day() {
        let data: FiveDayResponse = serde_json::from_value(json!({
            "list": [
                {"dt": 1, "main": {"temp": 12.0, "humidity": 80}, "weather": [{"description": "light rain"}]},
                {"dt": 2, "main": {"temp": 14.5, "humidity": 70}, "weather": []}
            ]
        }))
        .unwrap();

        let summary = summarize_five_day(data, Units::Celsius);
        let forecast = summary["daily_forecast"].as_array().unwrap();
        assert_eq!(forecast.len(), 2);
        assert_eq!(forecast[0]["description"], json!("light rain"));
        assert_eq!(forecast[1]["description"], json!("unknown"));
        assert_eq!(forecast[1]["temperature"], json!(14.5));
    }
}
