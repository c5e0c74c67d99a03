use crate::aggregate::DefaultView;
use crate::errors::{Error, Result};
use crate::model::Position;
use crate::tracker::TrackerConfig;
use chrono::Duration;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

const MAX_FRESHNESS_SECS: i64 = 30 * 24 * 3600;
const MAX_SKEW_SECS: i64 = 24 * 3600;

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Unset means no seeding and no archival.
    pub database_url: Option<String>,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub http_addr: String,
    pub archive_batch_size: usize,
    pub archive_batch_timeout_ms: u64,
    pub archive_channel_capacity: usize,
    pub tracker: TrackerConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = TrackerConfig::default();
        let default_view = DefaultView::default();

        let freshness_secs: i64 = parse_var(&lookup, "FRESHNESS_WINDOW_SECS", 300)?;
        let skew_secs: i64 = parse_var(&lookup, "FUTURE_SKEW_SECS", 60)?;
        if !(1..=MAX_FRESHNESS_SECS).contains(&freshness_secs) {
            return Err(Error::Config(format!(
                "FRESHNESS_WINDOW_SECS must be between 1 and {}",
                MAX_FRESHNESS_SECS
            )));
        }
        if !(0..=MAX_SKEW_SECS).contains(&skew_secs) {
            return Err(Error::Config(format!(
                "FUTURE_SKEW_SECS must be between 0 and {}",
                MAX_SKEW_SECS
            )));
        }

        let history_capacity: usize = parse_var(&lookup, "HISTORY_CAPACITY", defaults.history_capacity)?;
        if history_capacity == 0 {
            return Err(Error::Config("HISTORY_CAPACITY must be at least 1".to_string()));
        }

        let view_lat: f64 = parse_var(&lookup, "DEFAULT_VIEW_LAT", default_view.center.lat)?;
        let view_lng: f64 = parse_var(&lookup, "DEFAULT_VIEW_LNG", default_view.center.lng)?;
        let view_zoom: u8 = parse_var(&lookup, "DEFAULT_VIEW_ZOOM", default_view.zoom)?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            mqtt_broker: lookup("MQTT_BROKER").unwrap_or_else(|| "localhost".to_string()),
            mqtt_port: parse_var(&lookup, "MQTT_PORT", 1883)?,
            mqtt_topic: lookup("MQTT_TOPIC").unwrap_or_else(|| "locations/#".to_string()),
            http_addr: lookup("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            archive_batch_size: parse_var(&lookup, "ARCHIVE_BATCH_SIZE", 500)?,
            archive_batch_timeout_ms: parse_var(&lookup, "ARCHIVE_BATCH_TIMEOUT_MS", 200)?,
            archive_channel_capacity: parse_var(&lookup, "ARCHIVE_CHANNEL_CAPACITY", 10_000)?,
            tracker: TrackerConfig {
                freshness_window: Duration::seconds(freshness_secs),
                future_skew: Duration::seconds(skew_secs),
                history_capacity,
                default_view: DefaultView {
                    center: Position::new(view_lat, view_lng),
                    zoom: view_zoom,
                },
            },
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
