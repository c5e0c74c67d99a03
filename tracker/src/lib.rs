pub mod aggregate;
pub mod batching;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod history;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod registry;
pub mod rest;
pub mod tracker;
pub mod validate;

pub use aggregate::{Bounds, DefaultView, FleetSnapshot, Viewport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{Error, Result};
pub use history::{HistoryStats, RecentSamples, Scope};
pub use hub::{DeltaKind, FleetDelta, Subscription};
pub use model::{Ack, Device, DeviceCategory, DeviceFields, DeviceView, LocationSample, LocationUpdate, Position, PositionFix};
pub use tracker::{FleetTracker, TrackerConfig, UsageReport};
