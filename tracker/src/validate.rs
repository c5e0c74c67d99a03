use crate::errors::{Error, Result};
use crate::model::LocationUpdate;
use chrono::{DateTime, Duration, Utc};

const LAT_MIN: f64 = -90.0;
const LAT_MAX: f64 = 90.0;
const LNG_MIN: f64 = -180.0;
const LNG_MAX: f64 = 180.0;
const BATTERY_MIN: f64 = 0.0;
const BATTERY_MAX: f64 = 100.0;

/// Validates a location update against its receipt time.
///
/// `max_skew` bounds how far in the future the update timestamp may be.
pub fn validate(update: &LocationUpdate, received_at: DateTime<Utc>, max_skew: Duration) -> Result<()> {
    // Validate device_id
    if update.device_id.trim().is_empty() {
        return Err(Error::InvalidUpdate("Device ID cannot be empty".to_string()));
    }

    // Validate latitude
    if !update.lat.is_finite() || update.lat < LAT_MIN || update.lat > LAT_MAX {
        return Err(Error::InvalidUpdate(format!(
            "Latitude {} out of range [{}, {}]",
            update.lat, LAT_MIN, LAT_MAX
        )));
    }

    // Validate longitude
    if !update.lng.is_finite() || update.lng < LNG_MIN || update.lng > LNG_MAX {
        return Err(Error::InvalidUpdate(format!(
            "Longitude {} out of range [{}, {}]",
            update.lng, LNG_MIN, LNG_MAX
        )));
    }

    // Validate timestamp skew
    let latest = received_at
        .checked_add_signed(max_skew)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if update.timestamp > latest {
        return Err(Error::InvalidUpdate(format!(
            "Timestamp {} is more than {}s ahead of receipt time {}",
            update.timestamp,
            max_skew.num_seconds(),
            received_at
        )));
    }

    if let Some(accuracy) = update.accuracy {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(Error::InvalidUpdate(format!(
                "Accuracy {} must be a non-negative radius",
                accuracy
            )));
        }
    }

    if let Some(battery) = update.battery {
        if !battery.is_finite() || battery < BATTERY_MIN || battery > BATTERY_MAX {
            return Err(Error::InvalidUpdate(format!(
                "Battery {} out of range [{}, {}]",
                battery, BATTERY_MIN, BATTERY_MAX
            )));
        }
    }

    Ok(())
}
