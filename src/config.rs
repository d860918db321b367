//! Application configuration

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use url::Url;

use crate::errors::CommandCenterError;

const ENV_PREFIX: &str = "COMMANDCENTER";
const DEFAULT_CONFIG: &str = "config/default";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub mqtt: MqttConfig,
    pub liveness: LivenessConfig,
    pub geocode: GeocodeConfig,
    pub view: ViewConfig,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub snapshot_path: String,
    pub geocode_path: String,
    pub max_retries: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub uri: String,
    pub port: u16,
    pub client_id: String,
    pub topics: Vec<String>,
    pub username: String,
    pub websocket: bool,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodeConfig {
    pub cache_capacity: usize,
}

/// Filter applied to the view the binary reports
#[derive(Debug, Deserialize, Clone)]
pub struct ViewConfig {
    pub search: String,
    pub district: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG)
    }

    /// Load from an optional file, overridden by `COMMANDCENTER__*` variables
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("api.snapshot_path", "api/stations/all")?
            .set_default("api.geocode_path", "api/geocode")?
            .set_default("api.max_retries", 3)?
            .set_default("api.request_timeout", 10)?
            .set_default("mqtt.port", 443)?
            .set_default("mqtt.username", "command-center")?
            .set_default("mqtt.websocket", true)?
            .set_default("mqtt.keep_alive", 5)?
            .set_default("mqtt.reconnect_delay", 5)?
            .set_default("liveness.timeout", 120)?
            .set_default("geocode.cache_capacity", 10_000)?
            .set_default("view.search", "")?
            .set_default("view.district", "ALL")?
            .add_source(File::with_name(&path.as_ref().to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), CommandCenterError> {
        self.api.validate()?;
        self.mqtt.validate()?;
        self.liveness.validate()?;
        self.geocode.validate()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> CommandCenterError {
    CommandCenterError::ConfigurationError {
        message: message.into(),
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), CommandCenterError> {
        Url::parse(&self.base_url)
            .map_err(|e| invalid(format!("API base URL is invalid: {}", e)))?;
        if self.snapshot_path.trim().is_empty() || self.geocode_path.trim().is_empty() {
            return Err(invalid("API paths cannot be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("Request timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), CommandCenterError> {
        if self.uri.trim().is_empty() {
            return Err(invalid("MQTT URI cannot be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(invalid("MQTT client id cannot be empty"));
        }
        if self.topics.is_empty() {
            return Err(invalid("At least one MQTT topic is required"));
        }
        if self.reconnect_delay.is_zero() {
            return Err(invalid("Reconnect delay must be greater than zero"));
        }
        Ok(())
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), CommandCenterError> {
        if self.timeout.is_zero() {
            return Err(invalid("Liveness timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl GeocodeConfig {
    pub fn validate(&self) -> Result<(), CommandCenterError> {
        if self.cache_capacity == 0 {
            return Err(invalid("Geocode cache capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;

    #[test]
    fn test_load_config() {
        env::set_var("COMMANDCENTER__API__BASE_URL", "https://dashboard.example.com");
        env::set_var("COMMANDCENTER__MQTT__URI", "wss://broker.example.com/mqtt");
        env::set_var(
            "COMMANDCENTER__MQTT__TOPICS",
            "stations/locationUpdate,stations/statusUpdate",
        );
        env::set_var("COMMANDCENTER__MQTT__CLIENT_ID", "test_client");
        env::set_var("COMMANDCENTER__MQTT__RECONNECT_DELAY", "7");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.api.base_url, "https://dashboard.example.com");
        assert_eq!(config.mqtt.uri, "wss://broker.example.com/mqtt");
        assert_eq!(
            config.mqtt.topics,
            vec!["stations/locationUpdate", "stations/statusUpdate"]
        );
        assert_eq!(config.mqtt.client_id, "test_client");
        assert_eq!(config.mqtt.reconnect_delay, Duration::from_secs(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[api]
base_url = "https://dashboard.example.com"

[mqtt]
uri = "broker.example.com"
client_id = "file_client"
topics = ["stations/locationUpdate"]

[liveness]
timeout = 90

[geocode]
cache_capacity = 250
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.liveness.timeout, Duration::from_secs(90));
        assert_eq!(config.geocode.cache_capacity, 250);
        assert_eq!(config.api.snapshot_path, "api/stations/all");
        assert_eq!(config.view.district, "ALL");
    }

    #[test]
    fn test_liveness_config_validate_zero_timeout() {
        let config = LivenessConfig {
            timeout: Duration::from_secs(0),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_config_validate_invalid_url() {
        let config = ApiConfig {
            base_url: "not a url".to_string(),
            auth_token: None,
            snapshot_path: "api/stations/all".to_string(),
            geocode_path: "api/geocode".to_string(),
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_geocode_config_validate_zero_capacity() {
        assert!(GeocodeConfig { cache_capacity: 0 }.validate().is_err());
        assert!(GeocodeConfig { cache_capacity: 1 }.validate().is_ok());
    }
}
