//! Status broadcast
//!
//! Observers are called synchronously, in subscription order, once per
//! distinct transition. Callbacks run outside the registry lock so they may
//! subscribe or unsubscribe themselves.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::state::SyncStatusEvent;

type Callback = Arc<dyn Fn(&SyncStatusEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: BTreeMap<u64, Callback>,
    last: Option<SyncStatusEvent>,
}

/// Observer registry for sync status events
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every later event
    pub fn subscribe(
        &self,
        callback: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.observers.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to all current observers.
    ///
    /// An event equal to the previous one is dropped; returns whether it was
    /// delivered.
    pub fn emit(&self, event: SyncStatusEvent) -> bool {
        let observers: Vec<Callback> = {
            let mut registry = self.registry.lock();
            if registry.last.as_ref() == Some(&event) {
                return false;
            }
            registry.last = Some(event.clone());
            registry.observers.values().cloned().collect()
        };

        tracing::trace!("Status {:?} to {} observers", event.kind, observers.len());
        for observer in observers {
            observer(&event);
        }
        true
    }

    /// Most recent delivered event
    pub fn last_event(&self) -> Option<SyncStatusEvent> {
        self.registry.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().observers.len()
    }
}

/// Handle returned by [`StatusBroadcaster::subscribe`]
#[must_use = "keep the subscription to unsubscribe later"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Stop receiving events; returns false if already removed
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.lock().observers.remove(&self.id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;
    use crate::state::{SyncEventKind, SyncPhase};
    use pretty_assertions::assert_eq;

    type Events = Arc<Mutex<Vec<SyncStatusEvent>>>;

    fn recorder(broadcaster: &StatusBroadcaster) -> (Events, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = broadcaster.subscribe(move |event| sink.lock().push(event.clone()));
        (events, subscription)
    }

    #[test]
    fn delivers_in_subscription_order() {
        let broadcaster = StatusBroadcaster::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let _subscriptions: Vec<Subscription> = (0..3)
            .map(|index| {
                let order = Arc::clone(&order);
                broadcaster.subscribe(move |_| order.lock().push(index))
            })
            .collect();

        assert!(broadcaster.emit(SyncStatusEvent::syncing(0, None, None)));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn consecutive_duplicates_are_dropped() {
        let broadcaster = StatusBroadcaster::new();
        let (events, _subscription) = recorder(&broadcaster);

        let pulling =
            SyncStatusEvent::syncing(0, Some(EntityType::Goals), Some(SyncPhase::Pulling));
        assert!(broadcaster.emit(pulling.clone()));
        assert!(!broadcaster.emit(pulling));
        assert!(broadcaster.emit(SyncStatusEvent::success("done")));

        let kinds: Vec<SyncEventKind> = events.lock().iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![SyncEventKind::Syncing, SyncEventKind::Success]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broadcaster = StatusBroadcaster::new();
        let (events, subscription) = recorder(&broadcaster);

        broadcaster.emit(SyncStatusEvent::syncing(0, None, None));
        assert!(subscription.unsubscribe());
        broadcaster.emit(SyncStatusEvent::success("done"));

        assert_eq!(events.lock().len(), 1);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn callback_may_subscribe_during_delivery() {
        let broadcaster = StatusBroadcaster::new();
        let inner = broadcaster.clone();
        let _subscription = broadcaster.subscribe(move |_| {
            let _nested = inner.subscribe(|_| {});
        });

        broadcaster.emit(SyncStatusEvent::idle());
        assert_eq!(broadcaster.subscriber_count(), 2);
    }
}
