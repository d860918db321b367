//! Errors for the command center
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandCenterError {
    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("HTTP request failed")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP middleware error")]
    HttpMiddlewareError(#[from] reqwest_middleware::Error),

    #[error("Invalid URL")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unauthorized request to {0}")]
    Unauthorized(String),

    #[error("Request to {endpoint} failed with status {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("Invalid topic")]
    InvalidTopic(String),

    #[error("Invalid station id")]
    InvalidStationId(String),

    #[error("Unknown event type")]
    UnknownEventType(String),

    #[error("Malformed geocoding response: {0}")]
    MalformedGeocode(String),

    #[error("Event channel rejected the connection: {0}")]
    ChannelRejected(String),

    #[error("Ingestor task has stopped")]
    IngestorStopped,

    #[error("Ingestor task failed")]
    TaskJoinError(#[from] tokio::task::JoinError),
}
