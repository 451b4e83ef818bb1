//! Per-profile listener registry and snapshot fan-out.

use super::types::{ListenerFn, ListenerId, SnapshotReceiver, Subscription};
use crate::types::UnreadMap;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

enum Sink {
    Callback(Arc<ListenerFn>),
    Channel(Sender<UnreadMap>),
}

/// Serializes deliveries to one listener. Holds revision + 1 of the
/// newest snapshot delivered (0 = none yet). Reentrant so a callback can
/// mutate the store it listens to.
type Gate = Arc<ReentrantMutex<Cell<u64>>>;

/// Internal listener state.
struct Listener {
    sink: Sink,
    gate: Gate,
}

impl Listener {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            gate: Arc::new(ReentrantMutex::new(Cell::new(0))),
        }
    }
}

/// Run `deliver` unless something as new already went through `gate`.
fn through_gate(gate: &Gate, revision: u64, deliver: impl FnOnce()) {
    let stamp = revision.saturating_add(1);
    let last = gate.lock();
    if last.get() >= stamp {
        return;
    }
    last.set(stamp);
    deliver();
}

/// Registry of listeners, keyed by profile id.
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, HashMap<ListenerId, Listener>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, profile_id: &str, id: ListenerId, listener: Listener) {
        self.listeners
            .write()
            .entry(profile_id.to_string())
            .or_default()
            .insert(id, listener);
    }

    /// Register a callback. The caller is responsible for the initial
    /// delivery (see [`ListenerRegistry::deliver_to`]).
    pub fn add_callback(self: &Arc<Self>, profile_id: &str, callback: Arc<ListenerFn>) -> Subscription {
        let id = self.next_id();
        self.insert(profile_id, id, Listener::new(Sink::Callback(callback)));
        Subscription::new(Arc::downgrade(self), profile_id, id)
    }

    /// Register a bounded channel.
    pub fn add_channel(self: &Arc<Self>, profile_id: &str, buffer_size: usize) -> SnapshotReceiver {
        let id = self.next_id();
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.insert(profile_id, id, Listener::new(Sink::Channel(sender)));
        SnapshotReceiver {
            subscription: Subscription::new(Arc::downgrade(self), profile_id, id),
            receiver,
        }
    }

    /// Remove a listener. Empty per-profile sets are dropped.
    pub fn remove(&self, profile_id: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(bucket) = listeners.get_mut(profile_id) else {
            return false;
        };
        let removed = bucket.remove(&id).is_some();
        if bucket.is_empty() {
            listeners.remove(profile_id);
        }
        removed
    }

    /// Number of listeners for a profile.
    pub fn listener_count(&self, profile_id: &str) -> usize {
        self.listeners
            .read()
            .get(profile_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Number of profiles with at least one listener.
    pub fn profile_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a snapshot to a single listener.
    pub fn deliver_to(&self, profile_id: &str, id: ListenerId, revision: u64, snapshot: &UnreadMap) {
        self.fan_out(profile_id, revision, snapshot, Some(id));
    }

    /// Deliver a snapshot to every listener of a profile.
    pub fn broadcast(&self, profile_id: &str, revision: u64, snapshot: &UnreadMap) {
        self.fan_out(profile_id, revision, snapshot, None);
    }

    fn fan_out(&self, profile_id: &str, revision: u64, snapshot: &UnreadMap, only: Option<ListenerId>) {
        let mut pending = Vec::new();
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            let Some(bucket) = listeners.get(profile_id) else {
                return;
            };
            for (id, listener) in bucket.iter() {
                if only.is_some_and(|target| target != *id) {
                    continue;
                }
                match &listener.sink {
                    Sink::Callback(callback) => {
                        pending.push((*id, Arc::clone(callback), Arc::clone(&listener.gate)));
                    }
                    Sink::Channel(sender) => {
                        through_gate(&listener.gate, revision, || {
                            if sender.try_send(snapshot.clone()).is_err() {
                                to_remove.push(*id);
                            }
                        });
                    }
                }
            }
        }

        // Callbacks run outside the registry lock so they may call back
        // into the store.
        for (id, callback, gate) in pending {
            through_gate(&gate, revision, || {
                let result = catch_unwind(AssertUnwindSafe(|| callback(snapshot)));
                if result.is_err() {
                    tracing::warn!(profile_id, listener = id.0, "unread listener panicked");
                }
            });
        }

        for id in to_remove {
            tracing::debug!(profile_id, listener = id.0, "dropping stalled snapshot channel");
            self.remove(profile_id, id);
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<UnreadMap>>>, Arc<ListenerFn>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<ListenerFn> = Arc::new(move |map: &UnreadMap| {
            sink.lock().push(map.clone());
        });
        (seen, callback)
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let registry = Arc::new(ListenerRegistry::new());
        let (_, callback) = recorder();

        let subscription = registry.add_callback("p1", callback);
        assert_eq!(registry.listener_count("p1"), 1);
        assert_eq!(registry.profile_count(), 1);

        subscription.unsubscribe();
        assert_eq!(registry.listener_count("p1"), 0);
        assert_eq!(registry.profile_count(), 0);

        // Idempotent.
        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = Arc::new(ListenerRegistry::new());
        let (_, callback) = recorder();
        {
            let _subscription = registry.add_callback("p1", callback);
            assert_eq!(registry.listener_count("p1"), 1);
        }
        assert_eq!(registry.listener_count("p1"), 0);
    }

    #[test]
    fn test_broadcast_scoped_to_profile() {
        let registry = Arc::new(ListenerRegistry::new());
        let (seen_a, callback_a) = recorder();
        let (seen_b, callback_b) = recorder();
        let _a = registry.add_callback("a", callback_a);
        let _b = registry.add_callback("b", callback_b);

        registry.broadcast("a", 1, &UnreadMap::from([("c1", 1)]));

        assert_eq!(seen_a.lock().len(), 1);
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_stale_revision_skipped() {
        let registry = Arc::new(ListenerRegistry::new());
        let (seen, callback) = recorder();
        let _sub = registry.add_callback("p1", callback);

        registry.broadcast("p1", 2, &UnreadMap::from([("c1", 2)]));
        registry.broadcast("p1", 1, &UnreadMap::from([("c1", 1)]));
        registry.broadcast("p1", 2, &UnreadMap::from([("c1", 2)]));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("c1"), 2);
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let registry = Arc::new(ListenerRegistry::new());
        let (seen, callback) = recorder();
        let _bad = registry.add_callback("p1", Arc::new(|_: &UnreadMap| panic!("boom")));
        let _good = registry.add_callback("p1", callback);

        registry.broadcast("p1", 0, &UnreadMap::new());

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(registry.listener_count("p1"), 2);
    }

    #[test]
    fn test_deliver_to_single_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let (seen_a, callback_a) = recorder();
        let (seen_b, callback_b) = recorder();
        let a = registry.add_callback("p1", callback_a);
        let _b = registry.add_callback("p1", callback_b);

        registry.deliver_to("p1", a.id(), 0, &UnreadMap::new());

        assert_eq!(seen_a.lock().len(), 1);
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_drop_slow_channel() {
        let registry = Arc::new(ListenerRegistry::new());
        let receiver = registry.add_channel("p1", 2);

        for revision in 0..10 {
            registry.broadcast("p1", revision, &UnreadMap::from([("c1", revision)]));
        }

        assert_eq!(registry.listener_count("p1"), 0);
        assert_eq!(receiver.try_recv().unwrap().get("c1"), 0);
    }

    #[test]
    fn test_disconnected_channel_removed() {
        let registry = Arc::new(ListenerRegistry::new());
        let SnapshotReceiver {
            subscription,
            receiver,
        } = registry.add_channel("p1", 4);
        drop(receiver);

        registry.broadcast("p1", 0, &UnreadMap::new());
        assert_eq!(registry.listener_count("p1"), 0);

        // Disposer still safe after the registry removed the listener.
        subscription.unsubscribe();
    }

    #[test]
    fn test_nested_delivery_on_same_thread() {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let weak = Arc::downgrade(&registry);
        let _sub = registry.add_callback(
            "p1",
            Arc::new(move |map: &UnreadMap| {
                sink.lock().push(map.get("c1"));
                if map.get("c1") == 1 {
                    if let Some(registry) = weak.upgrade() {
                        registry.broadcast("p1", 2, &UnreadMap::from([("c1", 2)]));
                    }
                }
            }),
        );

        registry.broadcast("p1", 1, &UnreadMap::from([("c1", 1)]));

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_older_delivery_finishes_before_newer() {
        let registry = Arc::new(ListenerRegistry::new());
        let (entered_tx, entered_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = registry.add_callback(
            "p1",
            Arc::new(move |map: &UnreadMap| {
                if map.get("c1") == 1 {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv();
                }
                sink.lock().push(map.get("c1"));
            }),
        );

        let slow = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.broadcast("p1", 1, &UnreadMap::from([("c1", 1)])))
        };
        entered_rx.recv().unwrap();

        let fast = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.broadcast("p1", 2, &UnreadMap::from([("c1", 2)])))
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        slow.join().unwrap();
        fast.join().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
