use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A latitude/longitude pair. Coordinates only ever travel together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Device category as supplied by the directory. Unknown labels are kept
/// verbatim in `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceCategory {
    Smartphone,
    Tablet,
    Laptop,
    GpsTracker,
    SmartWatch,
    Vehicle,
    Other,
    Custom(String),
}

impl Default for DeviceCategory {
    fn default() -> Self {
        Self::Smartphone
    }
}

impl DeviceCategory {
    pub fn label(&self) -> &str {
        match self {
            Self::Smartphone => "Smartphone",
            Self::Tablet => "Tablet",
            Self::Laptop => "Laptop",
            Self::GpsTracker => "GPS Tracker",
            Self::SmartWatch => "Smart Watch",
            Self::Vehicle => "Vehicle",
            Self::Other => "Other",
            Self::Custom(label) => label,
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DeviceCategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Ok(match normalized.as_str() {
            "smartphone" => Self::Smartphone,
            "tablet" => Self::Tablet,
            "laptop" => Self::Laptop,
            "gpstracker" => Self::GpsTracker,
            "smartwatch" => Self::SmartWatch,
            "vehicle" => Self::Vehicle,
            "other" => Self::Other,
            _ => Self::Custom(s.trim().to_string()),
        })
    }
}

impl From<String> for DeviceCategory {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<DeviceCategory> for String {
    fn from(category: DeviceCategory) -> Self {
        category.label().to_string()
    }
}

/// Authoritative state of one tracked device.
///
/// Activity is not stored; evaluate it with [`Device::is_active`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub category: DeviceCategory,
    pub position: Option<Position>,
    pub last_seen: Option<DateTime<Utc>>,
    pub battery: Option<f64>,
    pub registered_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        category: DeviceCategory,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            category,
            position: None,
            last_seen: None,
            battery: None,
            registered_at,
        }
    }

    /// True iff the device was seen less than `window` before `now`.
    pub fn is_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_seen.is_some_and(|seen| now - seen < window)
    }

    pub fn view(&self, now: DateTime<Utc>, window: Duration) -> DeviceView {
        DeviceView {
            device: self.clone(),
            is_active: self.is_active(now, window),
        }
    }
}

/// A device together with its activity flag evaluated at read time.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub is_active: bool,
}

/// A position observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFix {
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

/// Partial device update. Only fields that are `Some` are replaced.
#[derive(Debug, Clone, Default)]
pub struct DeviceFields {
    pub name: Option<String>,
    pub category: Option<DeviceCategory>,
    pub fix: Option<PositionFix>,
    pub battery: Option<f64>,
}

/// Location event as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default, alias = "battery_level")]
    pub battery: Option<f64>,
}

impl LocationUpdate {
    pub fn fields(&self) -> DeviceFields {
        DeviceFields {
            fix: Some(PositionFix {
                position: Position::new(self.lat, self.lng),
                timestamp: self.timestamp,
            }),
            battery: self.battery,
            ..DeviceFields::default()
        }
    }
}

/// An accepted location point. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub battery: Option<f64>,
}

impl From<LocationUpdate> for LocationSample {
    fn from(update: LocationUpdate) -> Self {
        Self {
            device_id: update.device_id,
            lat: update.lat,
            lng: update.lng,
            timestamp: update.timestamp,
            accuracy: update.accuracy,
            battery: update.battery,
        }
    }
}

/// Acknowledgement for an accepted update.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub device_id: String,
    pub version: u64,
    pub accepted_at: DateTime<Utc>,
}
