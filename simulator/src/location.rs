use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Payload accepted on `locations/<device_id>`.
#[derive(Debug, Clone, Serialize)]
pub struct LocationUpdate {
    pub device_id: String,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub battery: Option<f64>,
}

/// Random walk for one simulated device.
#[derive(Debug, Clone)]
pub struct Walker {
    pub device_id: String,
    lat: f64,
    lng: f64,
    battery: f64,
}

impl Walker {
    pub fn spawn(rng: &mut impl Rng, device_id: String, center: (f64, f64), spread: f64) -> Self {
        Self {
            device_id,
            lat: center.0 + rng.gen_range(-spread..spread),
            lng: center.1 + rng.gen_range(-spread..spread),
            battery: rng.gen_range(40.0..100.0),
        }
    }

    /// Moves the device by up to `step` degrees and drains its battery.
    pub fn step(&mut self, rng: &mut impl Rng, step: f64) -> LocationUpdate {
        self.lat = (self.lat + rng.gen_range(-step..=step)).clamp(-90.0, 90.0);
        self.lng = (self.lng + rng.gen_range(-step..=step)).clamp(-180.0, 180.0);
        self.battery = (self.battery - rng.gen_range(0.0..0.05)).max(0.0);
        if self.battery == 0.0 {
            self.battery = 100.0; // recharged
        }

        let accuracy = if rng.gen_bool(0.1) {
            None
        } else {
            Some(rng.gen_range(3.0..50.0))
        };

        LocationUpdate {
            device_id: self.device_id.clone(),
            lat: self.lat,
            lng: self.lng,
            timestamp: Utc::now(),
            accuracy,
            battery: Some((self.battery * 10.0).round() / 10.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_walk_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut walker = Walker::spawn(&mut rng, "sim-dev-0".to_string(), (89.99, 179.99), 0.01);
        for _ in 0..1000 {
            let update = walker.step(&mut rng, 0.01);
            assert!((-90.0..=90.0).contains(&update.lat));
            assert!((-180.0..=180.0).contains(&update.lng));
            let battery = update.battery.unwrap();
            assert!((0.0..=100.0).contains(&battery));
        }
    }
}
