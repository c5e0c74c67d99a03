use crate::model::{Device, Position};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Devices seen within this window count towards `FleetSnapshot::recent`.
const RECENT_WINDOW_SECS: i64 = 3600;

/// Geographic bounding box over a set of positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    fn point(p: Position) -> Self {
        Self {
            south: p.lat,
            west: p.lng,
            north: p.lat,
            east: p.lng,
        }
    }

    fn extend(&mut self, p: Position) {
        self.south = self.south.min(p.lat);
        self.north = self.north.max(p.lat);
        self.west = self.west.min(p.lng);
        self.east = self.east.max(p.lng);
    }

    pub fn center(&self) -> Position {
        Position::new((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }

    pub fn contains(&self, p: Position) -> bool {
        p.lat >= self.south && p.lat <= self.north && p.lng >= self.west && p.lng <= self.east
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevicePosition {
    pub device_id: String,
    pub position: Position,
    pub is_active: bool,
}

/// Point-in-time aggregate over one owner's devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub owner_id: String,
    /// Registry version this snapshot reflects.
    pub version: u64,
    pub computed_at: DateTime<Utc>,
    pub total: usize,
    pub active: usize,
    pub recent: usize,
    pub positioned: Vec<DevicePosition>,
    /// `None` when no device has a position.
    pub bounds: Option<Bounds>,
}

/// Map view used when there is nothing to fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DefaultView {
    pub center: Position,
    pub zoom: u8,
}

impl Default for DefaultView {
    fn default() -> Self {
        Self {
            center: Position::new(-6.208763, 106.845172),
            zoom: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Viewport {
    Fit { bounds: Bounds },
    Default { center: Position, zoom: u8 },
}

impl FleetSnapshot {
    pub fn viewport(&self, fallback: &DefaultView) -> Viewport {
        match self.bounds {
            Some(bounds) => Viewport::Fit { bounds },
            None => Viewport::Default {
                center: fallback.center,
                zoom: fallback.zoom,
            },
        }
    }
}

/// Computes the snapshot for `owner_id` from the devices it owns.
///
/// Pure: the result depends only on the arguments.
pub fn aggregate<'a, I>(
    owner_id: &str,
    devices: I,
    version: u64,
    now: DateTime<Utc>,
    freshness_window: Duration,
) -> FleetSnapshot
where
    I: IntoIterator<Item = &'a Device>,
{
    let recent_window = Duration::seconds(RECENT_WINDOW_SECS);
    let mut total = 0;
    let mut active = 0;
    let mut recent = 0;
    let mut positioned = Vec::new();
    let mut bounds: Option<Bounds> = None;

    for device in devices {
        total += 1;
        let is_active = device.is_active(now, freshness_window);
        if is_active {
            active += 1;
        }
        if device.is_active(now, recent_window) {
            recent += 1;
        }

        if let Some(position) = device.position {
            match bounds.as_mut() {
                Some(b) => b.extend(position),
                None => bounds = Some(Bounds::point(position)),
            }
            positioned.push(DevicePosition {
                device_id: device.id.clone(),
                position,
                is_active,
            });
        }
    }

    FleetSnapshot {
        owner_id: owner_id.to_string(),
        version,
        computed_at: now,
        total,
        active,
        recent,
        positioned,
        bounds,
    }
}
