use crate::errors::{Error, Result};
use crate::model::{Device, DeviceFields};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Authoritative device state, keyed by device id.
///
/// Every mutation bumps `version`. The registry itself is not synchronized;
/// `FleetTracker` owns it behind a lock.
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<String, Device>,
    order: Vec<String>,
    version: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Bulk seeding from the durable store. Ids already present are skipped.
    /// Returns the ids actually inserted, in order.
    pub fn load<I>(&mut self, devices: I) -> Vec<String>
    where
        I: IntoIterator<Item = Device>,
    {
        let mut inserted = Vec::new();
        for device in devices {
            if self.devices.contains_key(&device.id) {
                warn!(device_id = %device.id, "Skipping duplicate device during load");
                continue;
            }
            inserted.push(device.id.clone());
            self.order.push(device.id.clone());
            self.devices.insert(device.id.clone(), device);
        }

        if !inserted.is_empty() {
            self.version += 1;
        }
        inserted
    }

    pub fn register(&mut self, device: Device) -> Result<u64> {
        if self.devices.contains_key(&device.id) {
            return Err(Error::DuplicateDevice(device.id));
        }

        debug!(device_id = %device.id, owner_id = %device.owner_id, "Registering device");
        self.order.push(device.id.clone());
        self.devices.insert(device.id.clone(), device);
        self.version += 1;
        Ok(self.version)
    }

    pub fn get(&self, id: &str) -> Result<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// All devices in registration order.
    pub fn list(&self) -> impl Iterator<Item = &Device> + '_ {
        self.order.iter().filter_map(|id| self.devices.get(id))
    }

    pub fn list_owned<'a>(&'a self, owner_id: &'a str) -> impl Iterator<Item = &'a Device> + 'a {
        self.list().filter(move |d| d.owner_id == owner_id)
    }

    /// Replaces the supplied fields of a device.
    ///
    /// A position fix moves `last_seen` to the fix timestamp and must be
    /// strictly newer than the current `last_seen`; otherwise the device is
    /// left untouched and `StaleUpdate` is returned.
    pub fn apply_update(&mut self, id: &str, fields: DeviceFields) -> Result<&Device> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;

        if let (Some(fix), Some(last_seen)) = (&fields.fix, device.last_seen) {
            if fix.timestamp <= last_seen {
                return Err(Error::StaleUpdate {
                    device_id: id.to_string(),
                    timestamp: fix.timestamp,
                    last_seen,
                });
            }
        }

        if let Some(name) = fields.name {
            device.name = name;
        }
        if let Some(category) = fields.category {
            device.category = category;
        }
        if let Some(fix) = fields.fix {
            device.position = Some(fix.position);
            device.last_seen = Some(fix.timestamp);
        }
        if let Some(battery) = fields.battery {
            device.battery = Some(battery);
        }

        self.version += 1;
        Ok(device)
    }

    pub fn remove(&mut self, id: &str) -> Result<Device> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))?;
        self.order.retain(|d| d != id);
        self.version += 1;
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceCategory, Position, PositionFix};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn device(id: &str, owner: &str) -> Device {
        Device::new(id, owner, id.to_uppercase(), DeviceCategory::Smartphone, at(0))
    }

    fn fix(lat: f64, lng: f64, secs: i64) -> DeviceFields {
        DeviceFields {
            fix: Some(PositionFix {
                position: Position::new(lat, lng),
                timestamp: at(secs),
            }),
            ..DeviceFields::default()
        }
    }

    #[test]
    fn test_list_keeps_registration_order() {
        let mut registry = Registry::new();
        for id in ["c", "a", "b"] {
            registry.register(device(id, "o1")).unwrap();
        }
        registry.remove("a").unwrap();
        registry.register(device("a", "o2")).unwrap();

        let ids: Vec<_> = registry.list().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let owned: Vec<_> = registry.list_owned("o1").map(|d| d.id.as_str()).collect();
        assert_eq!(owned, vec!["c", "b"]);
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut registry = Registry::new();
        registry.register(device("a", "o1")).unwrap();
        let result = registry.register(device("a", "o1"));
        assert!(matches!(result, Err(Error::DuplicateDevice(_))));
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn test_apply_update_unknown_device() {
        let mut registry = Registry::new();
        let result = registry.apply_update("ghost", fix(1.0, 1.0, 10));
        assert!(matches!(result, Err(Error::UnknownDevice(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_apply_update_replaces_only_supplied_fields() {
        let mut registry = Registry::new();
        registry.register(device("a", "o1")).unwrap();
        registry.apply_update("a", fix(1.0, 2.0, 10)).unwrap();

        let renamed = DeviceFields {
            name: Some("Van 7".to_string()),
            ..DeviceFields::default()
        };
        let updated = registry.apply_update("a", renamed).unwrap();
        assert_eq!(updated.name, "Van 7");
        assert_eq!(updated.position, Some(Position::new(1.0, 2.0)));
        assert_eq!(updated.last_seen, Some(at(10)));
        assert_eq!(updated.category, DeviceCategory::Smartphone);
    }

    #[test]
    fn test_in_order_updates_end_at_last() {
        let mut registry = Registry::new();
        registry.register(device("a", "o1")).unwrap();
        for (i, secs) in [10, 20, 30].into_iter().enumerate() {
            registry.apply_update("a", fix(i as f64, i as f64, secs)).unwrap();
        }
        let a = registry.get("a").unwrap();
        assert_eq!(a.position, Some(Position::new(2.0, 2.0)));
        assert_eq!(a.last_seen, Some(at(30)));
    }

    #[test]
    fn test_stale_fix_does_not_regress() {
        let mut registry = Registry::new();
        registry.register(device("a", "o1")).unwrap();
        registry.apply_update("a", fix(10.0, 20.0, 100)).unwrap();
        let version = registry.version();

        for secs in [90, 100] {
            let result = registry.apply_update("a", fix(11.0, 21.0, secs));
            assert!(matches!(result, Err(Error::StaleUpdate { .. })));
        }

        let a = registry.get("a").unwrap();
        assert_eq!(a.position, Some(Position::new(10.0, 20.0)));
        assert_eq!(a.last_seen, Some(at(100)));
        assert_eq!(registry.version(), version);
    }

    #[test]
    fn test_load_skips_known_ids() {
        let mut registry = Registry::new();
        registry.register(device("a", "o1")).unwrap();
        let loaded = registry.load(vec![device("a", "o1"), device("b", "o1"), device("b", "o1")]);
        assert_eq!(loaded, vec!["b".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.version(), 2);
    }

    #[test]
    fn test_remove_unknown() {
        let mut registry = Registry::new();
        assert!(matches!(registry.remove("a"), Err(Error::UnknownDevice(_))));
    }
}
