use crate::model::LocationSample;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const DEFAULT_CAPACITY: usize = 100;

/// Which devices a history query covers.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    Device(&'a str),
    Devices(&'a [String]),
    All,
}

impl Scope<'_> {
    fn includes(&self, device_id: &str) -> bool {
        match self {
            Scope::Device(id) => *id == device_id,
            Scope::Devices(ids) => ids.iter().any(|id| id == device_id),
            Scope::All => true,
        }
    }
}

/// Aggregates computed on demand over the retained samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub sample_count: usize,
    /// Mean over samples that report an accuracy; `None` if none do.
    pub mean_accuracy: Option<f64>,
    pub per_device: BTreeMap<String, usize>,
}

/// Newest-first samples copied out of the history at query time.
#[derive(Debug)]
pub struct RecentSamples {
    inner: std::vec::IntoIter<LocationSample>,
}

impl Iterator for RecentSamples {
    type Item = LocationSample;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for RecentSamples {}

/// Bounded per-device rolling windows of accepted samples.
#[derive(Debug)]
pub struct History {
    capacity: usize,
    windows: RwLock<HashMap<String, VecDeque<LocationSample>>>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a sample, evicting the oldest one once the window is full.
    pub fn append(&self, sample: LocationSample) {
        let mut windows = self.windows.write();
        let window = windows
            .entry(sample.device_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        while window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(sample);
    }

    pub fn forget(&self, device_id: &str) {
        self.windows.write().remove(device_id);
    }

    pub fn len(&self, device_id: &str) -> usize {
        self.windows.read().get(device_id).map_or(0, VecDeque::len)
    }

    /// Up to `limit` samples in scope, newest first.
    pub fn recent(&self, scope: Scope<'_>, limit: usize) -> RecentSamples {
        let windows = self.windows.read();

        let samples: Vec<LocationSample> = match scope {
            Scope::Device(id) => windows
                .get(id)
                .map(|w| w.iter().rev().take(limit).cloned().collect())
                .unwrap_or_default(),
            _ => {
                let mut matching: Vec<&LocationSample> = windows
                    .iter()
                    .filter(|(id, _)| scope.includes(id))
                    .flat_map(|(_, w)| w.iter())
                    .collect();
                matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                matching.into_iter().take(limit).cloned().collect()
            }
        };

        RecentSamples {
            inner: samples.into_iter(),
        }
    }

    pub fn stats(&self, scope: Scope<'_>) -> HistoryStats {
        let windows = self.windows.read();
        let mut stats = HistoryStats::default();
        let mut accuracy_sum = 0.0;
        let mut accuracy_count = 0usize;

        for (device_id, window) in windows.iter().filter(|(id, _)| scope.includes(id)) {
            stats.sample_count += window.len();
            stats.per_device.insert(device_id.clone(), window.len());
            for accuracy in window.iter().filter_map(|s| s.accuracy) {
                accuracy_sum += accuracy;
                accuracy_count += 1;
            }
        }

        if accuracy_count > 0 {
            stats.mean_accuracy = Some(accuracy_sum / accuracy_count as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(device: &str, secs: i64, accuracy: Option<f64>) -> LocationSample {
        LocationSample {
            device_id: device.to_string(),
            lat: secs as f64 / 10.0,
            lng: 0.0,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            accuracy,
            battery: None,
        }
    }

    fn secs(samples: RecentSamples) -> Vec<i64> {
        samples.map(|s| s.timestamp.timestamp()).collect()
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let history = History::new(3);
        for t in 1..=5 {
            history.append(sample("a", t, None));
        }
        assert_eq!(history.len("a"), 3);
        assert_eq!(secs(history.recent(Scope::Device("a"), 10)), vec![5, 4, 3]);
    }

    #[test]
    fn test_default_capacity() {
        let history = History::default();
        for t in 0..150 {
            history.append(sample("a", t, None));
        }
        assert_eq!(history.len("a"), DEFAULT_CAPACITY);
        assert_eq!(history.recent(Scope::Device("a"), 1).next().unwrap().timestamp.timestamp(), 149);
    }

    #[test]
    fn test_recent_respects_limit_and_scope() {
        let history = History::new(10);
        history.append(sample("a", 1, None));
        history.append(sample("b", 2, None));
        history.append(sample("a", 3, None));
        history.append(sample("c", 4, None));

        assert_eq!(secs(history.recent(Scope::All, 3)), vec![4, 3, 2]);
        let owned = vec!["a".to_string(), "b".to_string()];
        assert_eq!(secs(history.recent(Scope::Devices(&owned), 10)), vec![3, 2, 1]);
        assert_eq!(history.recent(Scope::Device("missing"), 10).len(), 0);
    }

    #[test]
    fn test_recent_is_a_point_in_time_copy() {
        let history = History::new(10);
        history.append(sample("a", 1, None));
        let recent = history.recent(Scope::Device("a"), 10);
        history.append(sample("a", 2, None));
        assert_eq!(secs(recent), vec![1]);
    }

    #[test]
    fn test_stats_ignore_unknown_accuracy() {
        let history = History::new(10);
        history.append(sample("a", 1, Some(4.0)));
        history.append(sample("a", 2, None));
        history.append(sample("b", 3, Some(8.0)));

        let stats = history.stats(Scope::All);
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.mean_accuracy, Some(6.0));
        assert_eq!(stats.per_device.get("a"), Some(&2));
        assert_eq!(stats.per_device.get("b"), Some(&1));
    }

    #[test]
    fn test_stats_follow_eviction() {
        let history = History::new(2);
        history.append(sample("a", 1, Some(100.0)));
        history.append(sample("a", 2, Some(2.0)));
        history.append(sample("a", 3, Some(4.0)));

        let stats = history.stats(Scope::Device("a"));
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.mean_accuracy, Some(3.0));
    }

    #[test]
    fn test_forget_drops_window() {
        let history = History::new(2);
        history.append(sample("a", 1, None));
        history.forget("a");
        assert_eq!(history.len("a"), 0);
        assert_eq!(history.stats(Scope::All), HistoryStats::default());
    }
}
