//! TOML config file loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatcher::DecisionPolicy;
use crate::weather::{Site, OPENWEATHER_FORECAST_URL};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub ingest: SessionConfig,
    pub command: SessionConfig,
    pub site: Site,
    #[serde(default)]
    pub weather: WeatherConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub policy: DecisionPolicy,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// One broker identity and the topic it works on.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub client_id: String,
    pub topic: String,
    pub root_ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_url")]
    pub base_url: String,
    /// Usually supplied through `OPENWEATHER_API_KEY` instead.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_weather_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_broker_port() -> u16 {
    8883
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_weather_url() -> String {
    OPENWEATHER_FORECAST_URL.to_string()
}

fn default_weather_timeout_secs() -> u64 {
    10
}

fn default_web_port() -> u16 {
    8000
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_url(),
            api_key: String::new(),
            timeout_secs: default_weather_timeout_secs(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl WeatherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `WEB_PORT` and `OPENWEATHER_API_KEY`.
    /// `get` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = get("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.broker.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port:?}"))?;
        }
        if let Some(port) = get("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port:?}"))?;
        }
        if let Some(key) = get("OPENWEATHER_API_KEY") {
            self.weather.api_key = key;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.validate_sessions(&mut errors);
        self.validate_site(&mut errors);
        self.validate_collaborators(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        if self.broker.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if self.broker.port == 0 {
            errors.push("broker: port must be non-zero".to_string());
        }
        if self.broker.keep_alive_secs == 0 {
            errors.push("broker: keep_alive_secs must be positive".to_string());
        }
    }

    fn validate_sessions(&self, errors: &mut Vec<String>) {
        for (name, s) in [("ingest", &self.ingest), ("command", &self.command)] {
            if s.client_id.trim().is_empty() {
                errors.push(format!("{name}: client_id is empty"));
            }
            if s.topic.trim().is_empty() {
                errors.push(format!("{name}: topic is empty"));
            } else if s.topic.contains(['+', '#']) {
                errors.push(format!("{name}: topic '{}' must not contain wildcards", s.topic));
            }
            for (field, path) in [("root_ca", &s.root_ca), ("cert", &s.cert), ("key", &s.key)] {
                if path.as_os_str().is_empty() {
                    errors.push(format!("{name}: {field} path is empty"));
                }
            }
        }

        // The broker drops one of two connections sharing a client id.
        if !self.ingest.client_id.is_empty() && self.ingest.client_id == self.command.client_id {
            errors.push(format!(
                "ingest and command share client_id '{}'",
                self.ingest.client_id
            ));
        }
        if !self.ingest.topic.is_empty() && self.ingest.topic == self.command.topic {
            errors.push(format!(
                "ingest and command share topic '{}'",
                self.ingest.topic
            ));
        }
    }

    fn validate_site(&self, errors: &mut Vec<String>) {
        let s = &self.site;
        if !(-90.0..=90.0).contains(&s.latitude) {
            errors.push(format!("site: latitude {} out of range [-90, 90]", s.latitude));
        }
        if !(-180.0..=180.0).contains(&s.longitude) {
            errors.push(format!(
                "site: longitude {} out of range [-180, 180]",
                s.longitude
            ));
        }
        if !s.altitude_m.is_finite() {
            errors.push("site: altitude_m is not a number".to_string());
        }
    }

    fn validate_collaborators(&self, errors: &mut Vec<String>) {
        if self.weather.base_url.trim().is_empty() {
            errors.push("weather: base_url is empty".to_string());
        }
        if self.weather.api_key.trim().is_empty() {
            errors.push("weather: api_key is empty (set OPENWEATHER_API_KEY)".to_string());
        }
        if self.weather.timeout_secs == 0 {
            errors.push("weather: timeout_secs must be positive".to_string());
        }

        if self.model.path.as_os_str().is_empty() {
            errors.push("model: path is empty".to_string());
        }

        let limit = self.policy.soil_moisture_limit_pct;
        if !(0.0..=100.0).contains(&limit) {
            errors.push(format!(
                "policy: soil_moisture_limit_pct {limit} out of range [0, 100]"
            ));
        }

        if self.web.port == 0 {
            errors.push("web: port must be non-zero".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, validate.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
