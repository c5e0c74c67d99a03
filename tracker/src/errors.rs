use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Stale update for device {device_id}: {timestamp} is not newer than {last_seen}")]
    StaleUpdate {
        device_id: String,
        timestamp: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
