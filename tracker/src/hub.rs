//! Subscription hub: per-owner fan-out of fleet deltas.
//!
//! Each subscriber owns a single-entry slot. Publishing never waits on a
//! subscriber: if the slot still holds an untaken delta, the new one is merged
//! into it (newer snapshot, union of affected ids). Slots only accept
//! versions newer than the last one offered, so a subscriber observes
//! strictly increasing versions with no duplicates.

use crate::aggregate::FleetSnapshot;
use crate::metrics::{ACTIVE_SUBSCRIBERS, SUBSCRIBER_OVERRUNS_TOTAL};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// Full state at subscription time.
    Initial,
    Change,
}

/// What a subscriber receives: the owner's snapshot after a mutation and the
/// devices that mutation touched.
#[derive(Debug, Clone, Serialize)]
pub struct FleetDelta {
    pub kind: DeltaKind,
    pub snapshot: Arc<FleetSnapshot>,
    pub affected: BTreeSet<String>,
    /// Number of earlier deltas folded into this one.
    pub coalesced: u32,
}

impl FleetDelta {
    pub fn initial(snapshot: FleetSnapshot, affected: BTreeSet<String>) -> Self {
        Self {
            kind: DeltaKind::Initial,
            snapshot: Arc::new(snapshot),
            affected,
            coalesced: 0,
        }
    }

    pub fn change<I>(snapshot: FleetSnapshot, affected: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            kind: DeltaKind::Change,
            snapshot: Arc::new(snapshot),
            affected: affected.into_iter().collect(),
            coalesced: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn owner_id(&self) -> &str {
        &self.snapshot.owner_id
    }

    fn absorb(&mut self, older: FleetDelta) {
        self.affected.extend(older.affected);
        self.coalesced += older.coalesced + 1;
        if older.kind == DeltaKind::Initial {
            self.kind = DeltaKind::Initial;
        }
    }
}

/// Result of offering a delta to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Queued,
    /// Subscriber overrun: merged into an untaken delta.
    Coalesced,
    /// Not newer than what the subscriber already has.
    Superseded,
    Closed,
}

#[derive(Debug)]
struct SlotState {
    pending: Option<FleetDelta>,
    last_offered: u64,
    closed: bool,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slot {
    fn new(initial: FleetDelta) -> Self {
        Self {
            state: Mutex::new(SlotState {
                last_offered: initial.version(),
                pending: Some(initial),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn offer(&self, delta: &FleetDelta) -> Offer {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Offer::Closed;
            }
            if delta.version() <= state.last_offered {
                return Offer::Superseded;
            }
            state.last_offered = delta.version();

            let mut next = delta.clone();
            let outcome = match state.pending.take() {
                Some(older) => {
                    next.absorb(older);
                    Offer::Coalesced
                }
                None => Offer::Queued,
            };
            state.pending = Some(next);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug, Default)]
struct HubInner {
    owners: RwLock<HashMap<String, HashMap<Uuid, Arc<Slot>>>>,
}

impl HubInner {
    fn remove(&self, owner_id: &str, id: &Uuid) -> bool {
        let mut owners = self.owners.write();
        let Some(slots) = owners.get_mut(owner_id) else {
            return false;
        };
        let Some(slot) = slots.remove(id) else {
            return false;
        };
        if slots.is_empty() {
            owners.remove(owner_id);
        }
        drop(owners);

        slot.close();
        ACTIVE_SUBSCRIBERS.dec();
        info!(subscription_id = %id, owner_id = %owner_id, "Subscriber released");
        true
    }
}

/// Fan-out point for fleet deltas, shared by the tracker and all
/// subscriptions.
#[derive(Debug, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber whose first item is `initial`. The owner is
    /// taken from the initial snapshot.
    pub fn subscribe(&self, initial: FleetDelta) -> Subscription {
        let id = Uuid::new_v4();
        let owner_id = initial.owner_id().to_string();
        let slot = Arc::new(Slot::new(initial));

        self.inner
            .owners
            .write()
            .entry(owner_id.clone())
            .or_default()
            .insert(id, Arc::clone(&slot));
        ACTIVE_SUBSCRIBERS.inc();
        info!(subscription_id = %id, owner_id = %owner_id, "Subscriber registered");

        Subscription {
            id,
            owner_id,
            slot,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Releases a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, owner_id: &str, id: &Uuid) -> bool {
        self.inner.remove(owner_id, id)
    }

    /// Offers `delta` to every subscriber of its owner and returns how many
    /// accepted it.
    pub fn publish(&self, delta: &FleetDelta) -> usize {
        let owners = self.inner.owners.read();
        let Some(slots) = owners.get(delta.owner_id()) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, slot) in slots {
            match slot.offer(delta) {
                Offer::Queued => delivered += 1,
                Offer::Coalesced => {
                    delivered += 1;
                    SUBSCRIBER_OVERRUNS_TOTAL.inc();
                    debug!(subscription_id = %id, version = delta.version(), "Subscriber overrun, coalescing");
                }
                Offer::Superseded | Offer::Closed => {}
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.owners.read().values().map(HashMap::len).sum()
    }

    /// Closes every subscription. Consumers see end of stream.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.inner.owners.write().drain().collect();
        for (_, slots) in drained {
            for slot in slots.into_values() {
                slot.close();
                ACTIVE_SUBSCRIBERS.dec();
            }
        }
    }
}

/// Consumer side of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    owner_id: String,
    slot: Arc<Slot>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Waits for the next delta. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn next(&mut self) -> Option<FleetDelta> {
        loop {
            {
                let mut state = self.slot.state.lock();
                if let Some(delta) = state.pending.take() {
                    return Some(delta);
                }
                if state.closed {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Takes the pending delta without waiting.
    pub fn try_next(&mut self) -> Option<FleetDelta> {
        self.slot.state.lock().pending.take()
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(&self.owner_id, &self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(owner: &str, version: u64) -> FleetSnapshot {
        FleetSnapshot {
            owner_id: owner.to_string(),
            version,
            computed_at: Utc::now(),
            total: 0,
            active: 0,
            recent: 0,
            positioned: Vec::new(),
            bounds: None,
        }
    }

    fn change(owner: &str, version: u64, device: &str) -> FleetDelta {
        FleetDelta::change(snapshot(owner, version), [device.to_string()])
    }

    #[test]
    fn test_initial_is_delivered_first() {
        let hub = Hub::new();
        let mut sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 3), BTreeSet::new()));

        let first = sub.try_next().unwrap();
        assert_eq!(first.kind, DeltaKind::Initial);
        assert_eq!(first.version(), 3);
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_publish_only_reaches_owner() {
        let hub = Hub::new();
        let mut a = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        let mut b = hub.subscribe(FleetDelta::initial(snapshot("o2", 0), BTreeSet::new()));
        a.try_next();
        b.try_next();

        assert_eq!(hub.publish(&change("o1", 1, "d1")), 1);
        assert_eq!(a.try_next().unwrap().version(), 1);
        assert!(b.try_next().is_none());
    }

    #[test]
    fn test_slow_subscriber_gets_coalesced_delta() {
        let hub = Hub::new();
        let mut sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        sub.try_next();

        hub.publish(&change("o1", 1, "d1"));
        hub.publish(&change("o1", 2, "d2"));
        hub.publish(&change("o1", 3, "d1"));

        let delta = sub.try_next().unwrap();
        assert_eq!(delta.version(), 3);
        assert_eq!(delta.kind, DeltaKind::Change);
        assert_eq!(delta.coalesced, 2);
        assert_eq!(
            delta.affected.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["d1", "d2"]
        );
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_untaken_initial_stays_initial_when_coalesced() {
        let hub = Hub::new();
        let mut sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 5), BTreeSet::new()));
        hub.publish(&change("o1", 6, "d1"));

        let delta = sub.try_next().unwrap();
        assert_eq!(delta.kind, DeltaKind::Initial);
        assert_eq!(delta.version(), 6);
    }

    #[test]
    fn test_older_or_repeated_versions_are_ignored() {
        let hub = Hub::new();
        let mut sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 5), BTreeSet::new()));
        sub.try_next();

        assert_eq!(hub.publish(&change("o1", 5, "d1")), 0);
        assert_eq!(hub.publish(&change("o1", 4, "d1")), 0);
        assert!(sub.try_next().is_none());

        hub.publish(&change("o1", 7, "d1"));
        assert_eq!(hub.publish(&change("o1", 6, "d2")), 0);
        assert_eq!(sub.try_next().unwrap().version(), 7);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub = Hub::new();
        let sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        let id = sub.id();

        assert!(hub.unsubscribe("o1", &id));
        assert!(!hub.unsubscribe("o1", &id));
        assert!(sub.is_closed());
        assert_eq!(hub.subscriber_count(), 0);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_releases_subscriber() {
        let hub = Hub::new();
        let keep = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        let gone = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        assert_eq!(hub.subscriber_count(), 2);

        drop(gone);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish(&change("o1", 1, "d1")), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish_and_ends_on_close() {
        let hub = Arc::new(Hub::new());
        let mut sub = hub.subscribe(FleetDelta::initial(snapshot("o1", 0), BTreeSet::new()));
        assert_eq!(sub.next().await.unwrap().kind, DeltaKind::Initial);

        let publisher = Arc::clone(&hub);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&change("o1", 1, "d1"));
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.close_all();
        });

        assert_eq!(sub.next().await.unwrap().version(), 1);
        assert!(sub.next().await.is_none());
        handle.await.unwrap();
    }
}
