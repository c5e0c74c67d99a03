//! The fleet engine.
//!
//! `FleetTracker` owns the registry, the subscription hub and the history
//! windows. Every registry mutation follows the same path: take the write
//! lock, mutate, downgrade to a read lock, aggregate the owner's snapshot and
//! publish it. Because a writer cannot commit while a previous writer still
//! holds its downgraded read guard, deltas reach the hub in commit order.

use crate::aggregate::{aggregate, DefaultView, FleetSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::errors::{Error, Result};
use crate::history::{History, HistoryStats, RecentSamples, Scope, DEFAULT_CAPACITY};
use crate::hub::{FleetDelta, Hub, Subscription};
use crate::metrics::{
    ACCEPTED_UPDATES_TOTAL, ARCHIVE_CHANNEL_FULL_TOTAL, INVALID_UPDATES_TOTAL,
    STALE_UPDATES_TOTAL, UNKNOWN_DEVICE_UPDATES_TOTAL, UPDATES_TOTAL,
};
use crate::model::{Ack, Device, DeviceCategory, DeviceFields, DeviceView, LocationSample, LocationUpdate};
use crate::registry::Registry;
use crate::validate::validate;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub freshness_window: Duration,
    pub future_skew: Duration,
    pub history_capacity: usize,
    pub default_view: DefaultView,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(5),
            future_skew: Duration::seconds(60),
            history_capacity: DEFAULT_CAPACITY,
            default_view: DefaultView::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceUsage {
    pub device_id: String,
    pub name: String,
    pub category: DeviceCategory,
    pub samples: usize,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Per-owner analytics over the retained history.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub owner_id: String,
    pub total_devices: usize,
    pub active_devices: usize,
    pub total_samples: usize,
    pub mean_accuracy: Option<f64>,
    pub devices: Vec<DeviceUsage>,
}

#[derive(Debug)]
pub struct FleetTracker {
    config: TrackerConfig,
    registry: RwLock<Registry>,
    hub: Hub,
    history: History,
    clock: Arc<dyn Clock>,
    archive: Option<mpsc::Sender<LocationSample>>,
}

impl FleetTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            history: History::new(config.history_capacity),
            config,
            registry: RwLock::new(Registry::new()),
            hub: Hub::new(),
            clock,
            archive: None,
        }
    }

    /// Forwards every accepted sample to `tx` for archival. Samples are
    /// dropped, not queued, when the channel is full.
    pub fn with_archive(mut self, tx: mpsc::Sender<LocationSample>) -> Self {
        self.archive = Some(tx);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Seeds the registry in bulk. Owners with subscribers get one delta each.
    pub async fn load(&self, devices: Vec<Device>) -> usize {
        let mut registry = self.registry.write().await;
        let inserted = registry.load(devices);
        let registry = registry.downgrade();

        let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for id in &inserted {
            if let Ok(device) = registry.get(id) {
                owners
                    .entry(device.owner_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        for (owner_id, affected) in owners.iter() {
            let delta = FleetDelta::change(self.snapshot_of(&registry, owner_id), affected.iter().cloned());
            self.hub.publish(&delta);
        }
        drop(registry);

        info!(loaded = inserted.len(), owners = owners.len(), "Registry seeded");
        inserted.len()
    }

    pub async fn register(&self, device: Device) -> Result<u64> {
        let owner_id = device.owner_id.clone();
        let device_id = device.id.clone();

        let mut registry = self.registry.write().await;
        let version = registry.register(device)?;
        let registry = registry.downgrade();
        self.publish_change(&registry, &owner_id, &device_id);
        drop(registry);

        info!(device_id = %device_id, owner_id = %owner_id, version, "Device registered");
        Ok(version)
    }

    /// Applies directory-side edits (name, category) or a raw field update.
    pub async fn update_device(&self, id: &str, fields: DeviceFields) -> Result<DeviceView> {
        let mut registry = self.registry.write().await;
        let device = registry.apply_update(id, fields)?.clone();
        let registry = registry.downgrade();
        self.publish_change(&registry, &device.owner_id, id);
        drop(registry);

        Ok(device.view(self.clock.now(), self.config.freshness_window))
    }

    pub async fn remove(&self, id: &str) -> Result<Device> {
        let mut registry = self.registry.write().await;
        let device = registry.remove(id)?;
        self.history.forget(id);
        let registry = registry.downgrade();
        self.publish_change(&registry, &device.owner_id, id);
        drop(registry);

        info!(device_id = %id, owner_id = %device.owner_id, "Device removed");
        Ok(device)
    }

    pub async fn get(&self, id: &str) -> Result<DeviceView> {
        let registry = self.registry.read().await;
        let device = registry.get(id)?;
        Ok(device.view(self.clock.now(), self.config.freshness_window))
    }

    /// Devices in registration order, optionally restricted to one owner.
    pub async fn list_devices(&self, owner_id: Option<&str>) -> Vec<DeviceView> {
        let now = self.clock.now();
        let window = self.config.freshness_window;
        let registry = self.registry.read().await;
        match owner_id {
            Some(owner) => registry.list_owned(owner).map(|d| d.view(now, window)).collect(),
            None => registry.list().map(|d| d.view(now, window)).collect(),
        }
    }

    /// Validates and applies a location update.
    ///
    /// On success the owner's subscribers receive a delta, then the sample is
    /// appended to history and forwarded to the archive.
    pub async fn submit_update(&self, update: LocationUpdate) -> Result<Ack> {
        UPDATES_TOTAL.inc();
        let received_at = self.clock.now();

        if let Err(e) = validate(&update, received_at, self.config.future_skew) {
            INVALID_UPDATES_TOTAL.inc();
            warn!(device_id = %update.device_id, "Rejected update: {}", e);
            return Err(e);
        }

        let mut registry = self.registry.write().await;
        let applied = registry
            .apply_update(&update.device_id, update.fields())
            .map(|device| device.owner_id.clone());
        let owner_id = match applied {
            Ok(owner_id) => owner_id,
            Err(e) => {
                drop(registry);
                match &e {
                    Error::StaleUpdate { .. } => {
                        STALE_UPDATES_TOTAL.inc();
                        debug!(device_id = %update.device_id, "Dropping stale update: {}", e);
                    }
                    Error::UnknownDevice(_) => {
                        UNKNOWN_DEVICE_UPDATES_TOTAL.inc();
                        warn!(device_id = %update.device_id, "Update for unknown device");
                    }
                    _ => {}
                }
                return Err(e);
            }
        };
        let version = registry.version();
        let registry = registry.downgrade();
        self.publish_change(&registry, &owner_id, &update.device_id);

        // Appended before the guard is released so the next commit for this
        // device cannot overtake it in the window.
        let sample = LocationSample::from(update);
        let device_id = sample.device_id.clone();
        self.history.append(sample.clone());
        self.archive_sample(sample);
        drop(registry);

        ACCEPTED_UPDATES_TOTAL.inc();
        debug!(device_id = %device_id, version, "Update accepted");
        Ok(Ack {
            device_id,
            version,
            accepted_at: received_at,
        })
    }

    /// Subscribes to an owner's fleet. The first item is the full snapshot
    /// as of registration; later items are deltas in commit order.
    pub async fn subscribe(&self, owner_id: &str) -> Subscription {
        let registry = self.registry.read().await;
        let snapshot = self.snapshot_of(&registry, owner_id);
        let affected = registry.list_owned(owner_id).map(|d| d.id.clone()).collect();
        // Registered under the read guard so no commit can slip in between.
        let subscription = self.hub.subscribe(FleetDelta::initial(snapshot, affected));
        drop(registry);
        subscription
    }

    pub async fn current_snapshot(&self, owner_id: &str) -> FleetSnapshot {
        let registry = self.registry.read().await;
        self.snapshot_of(&registry, owner_id)
    }

    /// Most recent samples for one device, newest first.
    pub async fn query_history(&self, device_id: &str, limit: usize) -> Result<RecentSamples> {
        self.registry.read().await.get(device_id)?;
        Ok(self.history.recent(Scope::Device(device_id), limit))
    }

    /// Most recent samples across an owner's fleet, newest first.
    pub async fn recent_activity(&self, owner_id: &str, limit: usize) -> RecentSamples {
        let ids = self.owned_ids(owner_id).await;
        self.history.recent(Scope::Devices(&ids), limit)
    }

    pub async fn usage_report(&self, owner_id: &str) -> UsageReport {
        let now = self.clock.now();
        let window = self.config.freshness_window;
        let devices: Vec<Device> = self
            .registry
            .read()
            .await
            .list_owned(owner_id)
            .cloned()
            .collect();
        let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        let HistoryStats {
            sample_count,
            mean_accuracy,
            per_device,
        } = self.history.stats(Scope::Devices(&ids));

        let devices: Vec<DeviceUsage> = devices
            .into_iter()
            .map(|d| DeviceUsage {
                samples: per_device.get(&d.id).copied().unwrap_or(0),
                is_active: d.is_active(now, window),
                last_seen: d.last_seen,
                device_id: d.id,
                name: d.name,
                category: d.category,
            })
            .collect();

        UsageReport {
            owner_id: owner_id.to_string(),
            total_devices: devices.len(),
            active_devices: devices.iter().filter(|d| d.is_active).count(),
            total_samples: sample_count,
            mean_accuracy,
            devices,
        }
    }

    async fn owned_ids(&self, owner_id: &str) -> Vec<String> {
        self.registry
            .read()
            .await
            .list_owned(owner_id)
            .map(|d| d.id.clone())
            .collect()
    }

    fn snapshot_of(&self, registry: &Registry, owner_id: &str) -> FleetSnapshot {
        aggregate(
            owner_id,
            registry.list_owned(owner_id),
            registry.version(),
            self.clock.now(),
            self.config.freshness_window,
        )
    }

    fn publish_change(&self, registry: &Registry, owner_id: &str, device_id: &str) {
        let snapshot = self.snapshot_of(registry, owner_id);
        let delivered = self
            .hub
            .publish(&FleetDelta::change(snapshot, [device_id.to_string()]));
        debug!(owner_id = %owner_id, device_id = %device_id, delivered, "Published fleet delta");
    }

    fn archive_sample(&self, sample: LocationSample) {
        let Some(tx) = &self.archive else {
            return;
        };
        match tx.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(sample)) => {
                ARCHIVE_CHANNEL_FULL_TOTAL.inc();
                debug!(device_id = %sample.device_id, "Archive channel full, dropping sample");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Archive channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hub::DeltaKind;
    use crate::model::Position;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn tracker_at(secs: i64) -> (FleetTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at(secs)));
        let tracker = FleetTracker::with_clock(TrackerConfig::default(), clock.clone());
        (tracker, clock)
    }

    fn device(id: &str, owner: &str) -> Device {
        Device::new(id, owner, id, DeviceCategory::Smartphone, at(0))
    }

    fn update(id: &str, lat: f64, lng: f64, secs: i64) -> LocationUpdate {
        LocationUpdate {
            device_id: id.to_string(),
            lat,
            lng,
            timestamp: at(secs),
            accuracy: Some(10.0),
            battery: Some(50.0),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_created() {
        let (tracker, _) = tracker_at(100);
        let result = tracker.submit_update(update("ghost", 1.0, 1.0, 100)).await;
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
        assert!(tracker.list_devices(None).await.is_empty());
        assert!(matches!(tracker.query_history("ghost", 10).await, Err(Error::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_accepted_update_reaches_history_and_archive() {
        let (tracker, _) = tracker_at(100);
        let (tx, mut rx) = mpsc::channel(4);
        let tracker = tracker.with_archive(tx);
        tracker.register(device("a", "o1")).await.unwrap();

        let ack = tracker.submit_update(update("a", 1.0, 2.0, 100)).await.unwrap();
        assert_eq!(ack.version, 2);
        assert_eq!(ack.accepted_at, at(100));

        let history: Vec<_> = tracker.query_history("a", 10).await.unwrap().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(rx.recv().await.unwrap().device_id, "a");

        let view = tracker.get("a").await.unwrap();
        assert_eq!(view.device.position, Some(Position::new(1.0, 2.0)));
        assert_eq!(view.device.battery, Some(50.0));
        assert!(view.is_active);
    }

    #[tokio::test]
    async fn test_activity_lapses_without_updates() {
        let (tracker, clock) = tracker_at(100);
        tracker.register(device("a", "o1")).await.unwrap();
        tracker.submit_update(update("a", 1.0, 2.0, 100)).await.unwrap();
        assert_eq!(tracker.current_snapshot("o1").await.active, 1);

        clock.advance(Duration::minutes(5));
        assert_eq!(tracker.current_snapshot("o1").await.active, 0);
        assert!(!tracker.get("a").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_full_archive_channel_does_not_block() {
        let (tracker, _) = tracker_at(100);
        let (tx, _rx) = mpsc::channel(1);
        let tracker = tracker.with_archive(tx);
        tracker.register(device("a", "o1")).await.unwrap();

        for secs in 90..=100 {
            tracker.submit_update(update("a", 1.0, 2.0, secs)).await.unwrap();
        }
        assert_eq!(tracker.query_history("a", 100).await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_remove_publishes_and_drops_history() {
        let (tracker, _) = tracker_at(100);
        tracker.register(device("a", "o1")).await.unwrap();
        tracker.submit_update(update("a", 1.0, 2.0, 100)).await.unwrap();

        let mut sub = tracker.subscribe("o1").await;
        assert_eq!(sub.next().await.unwrap().snapshot.total, 1);

        tracker.remove("a").await.unwrap();
        let delta = sub.next().await.unwrap();
        assert_eq!(delta.kind, DeltaKind::Change);
        assert_eq!(delta.snapshot.total, 0);
        assert!(delta.snapshot.bounds.is_none());
        assert!(delta.affected.contains("a"));
        assert!(matches!(tracker.remove("a").await, Err(Error::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_directory_edit_keeps_position() {
        let (tracker, _) = tracker_at(100);
        tracker.register(device("a", "o1")).await.unwrap();
        tracker.submit_update(update("a", 1.0, 2.0, 100)).await.unwrap();

        let fields = DeviceFields {
            name: Some("Truck".to_string()),
            category: Some(DeviceCategory::Vehicle),
            ..DeviceFields::default()
        };
        let view = tracker.update_device("a", fields).await.unwrap();
        assert_eq!(view.device.name, "Truck");
        assert_eq!(view.device.position, Some(Position::new(1.0, 2.0)));
    }

    #[tokio::test]
    async fn test_load_publishes_to_existing_subscribers() {
        let (tracker, _) = tracker_at(100);
        let mut sub = tracker.subscribe("o1").await;
        assert_eq!(sub.next().await.unwrap().snapshot.total, 0);

        let mut seeded = device("a", "o1");
        seeded.position = Some(Position::new(3.0, 4.0));
        seeded.last_seen = Some(at(50));
        let loaded = tracker.load(vec![seeded, device("b", "o2")]).await;
        assert_eq!(loaded, 2);

        let delta = sub.next().await.unwrap();
        assert_eq!(delta.snapshot.total, 1);
        assert_eq!(delta.affected.len(), 1);
        assert!(delta.snapshot.bounds.is_some());
    }

    #[tokio::test]
    async fn test_load_leaves_out_devices_already_registered() {
        let (tracker, _) = tracker_at(100);
        tracker.register(device("a", "o1")).await.unwrap();
        tracker.register(device("x", "o2")).await.unwrap();
        let mut first = tracker.subscribe("o1").await;
        let mut second = tracker.subscribe("o2").await;
        first.next().await.unwrap();
        second.next().await.unwrap();

        let loaded = tracker
            .load(vec![device("a", "o1"), device("b", "o1"), device("x", "o2")])
            .await;
        assert_eq!(loaded, 1);

        let delta = first.try_next().unwrap();
        assert_eq!(delta.affected, BTreeSet::from(["b".to_string()]));
        assert!(second.try_next().is_none());
    }

    #[tokio::test]
    async fn test_usage_report() {
        let (tracker, _) = tracker_at(100);
        tracker.register(device("a", "o1")).await.unwrap();
        tracker.register(device("b", "o1")).await.unwrap();
        tracker.register(device("c", "o2")).await.unwrap();
        tracker.submit_update(update("a", 1.0, 1.0, 99)).await.unwrap();
        tracker.submit_update(update("a", 1.0, 1.0, 100)).await.unwrap();
        tracker.submit_update(update("c", 1.0, 1.0, 100)).await.unwrap();

        let report = tracker.usage_report("o1").await;
        assert_eq!(report.total_devices, 2);
        assert_eq!(report.active_devices, 1);
        assert_eq!(report.total_samples, 2);
        assert_eq!(report.mean_accuracy, Some(10.0));
        assert_eq!(report.devices[0].samples, 2);
        assert_eq!(report.devices[1].samples, 0);

        let recent: Vec<_> = tracker.recent_activity("o1", 10).await.collect();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, at(100));
    }
}
