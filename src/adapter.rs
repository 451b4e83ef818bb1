//! Reactive badge adapter for the signed-in profile.
//!
//! [`UnreadBadge`] follows one profile at a time. Switching profiles tears
//! down the previous subscription before a new one is made, and snapshots
//! still in flight from the old subscription are discarded, so nothing
//! from a previous profile leaks into the exposed state.

use crate::store::UnreadStore;
use crate::subscriptions::Subscription;
use crate::types::UnreadMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Lifecycle of an adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BadgeState {
    /// No profile; the exposed map is empty.
    Idle,
    /// Subscribed, waiting for the first snapshot.
    Subscribing(String),
    /// At least one snapshot has been received.
    Active(String),
}

struct BadgeView {
    /// Identifies the current subscription; stale deliveries don't match.
    generation: u64,
    state: BadgeState,
    map: UnreadMap,
    total: u64,
}

impl BadgeView {
    fn reset(&mut self, state: BadgeState) {
        self.generation += 1;
        self.state = state;
        self.map = UnreadMap::new();
        self.total = 0;
    }
}

/// Unread badge state for the active profile.
///
/// Mutation helpers silently do nothing when no profile is active or the
/// arguments are empty.
pub struct UnreadBadge {
    store: Arc<UnreadStore>,
    view: Arc<Mutex<BadgeView>>,
    profile_id: Option<String>,
    subscription: Option<Subscription>,
}

impl UnreadBadge {
    /// Create an idle adapter.
    pub fn new(store: Arc<UnreadStore>) -> Self {
        Self {
            store,
            view: Arc::new(Mutex::new(BadgeView {
                generation: 0,
                state: BadgeState::Idle,
                map: UnreadMap::new(),
                total: 0,
            })),
            profile_id: None,
            subscription: None,
        }
    }

    /// Create an adapter already following `profile_id`.
    pub fn with_profile(store: Arc<UnreadStore>, profile_id: Option<&str>) -> Self {
        let mut badge = Self::new(store);
        badge.set_profile(profile_id);
        badge
    }

    /// Follow a different profile (or none).
    ///
    /// Setting the profile that is already active does nothing.
    pub fn set_profile(&mut self, profile_id: Option<&str>) {
        let profile_id = profile_id.filter(|id| !id.is_empty());
        if profile_id == self.profile_id.as_deref() {
            return;
        }

        if let Some(previous) = self.subscription.take() {
            previous.unsubscribe();
        }

        let Some(profile_id) = profile_id else {
            self.profile_id = None;
            self.view.lock().reset(BadgeState::Idle);
            return;
        };

        let generation = {
            let mut view = self.view.lock();
            view.reset(BadgeState::Subscribing(profile_id.to_string()));
            view.generation
        };
        self.profile_id = Some(profile_id.to_string());

        self.store.initialize_in_background(profile_id);

        let view = Arc::downgrade(&self.view);
        let active = profile_id.to_string();
        self.subscription = Some(self.store.subscribe(profile_id, move |snapshot| {
            apply_snapshot(&view, generation, &active, snapshot);
        }));
    }

    /// Profile currently followed.
    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    pub fn state(&self) -> BadgeState {
        self.view.lock().state.clone()
    }

    /// The exposed map (last snapshot received).
    pub fn unread_map(&self) -> UnreadMap {
        self.view.lock().map.clone()
    }

    /// Sum of the exposed map.
    pub fn total_unread(&self) -> u64 {
        self.view.lock().total
    }

    /// Synchronous read straight from the store, bypassing the exposed
    /// state.
    pub fn get_snapshot(&self) -> UnreadMap {
        match self.profile_id.as_deref() {
            Some(profile_id) => self.store.get_snapshot(profile_id),
            None => UnreadMap::new(),
        }
    }

    pub fn ensure_tracked<S: AsRef<str>>(&self, conversation_ids: &[S]) {
        if let Some(profile_id) = self.profile_id.as_deref() {
            if !conversation_ids.is_empty() {
                self.store.ensure_tracked_keys(profile_id, conversation_ids);
            }
        }
    }

    pub fn increment(&self, conversation_id: &str, step: i64) {
        if let Some(profile_id) = self.profile_id.as_deref() {
            if !conversation_id.is_empty() {
                self.store.increment(profile_id, conversation_id, step);
            }
        }
    }

    pub fn reset(&self, conversation_id: &str) {
        if let Some(profile_id) = self.profile_id.as_deref() {
            if !conversation_id.is_empty() {
                self.store.reset(profile_id, conversation_id);
            }
        }
    }

    pub fn reset_bulk<S: AsRef<str>>(&self, conversation_ids: &[S]) {
        if let Some(profile_id) = self.profile_id.as_deref() {
            if !conversation_ids.is_empty() {
                self.store.reset_bulk(profile_id, conversation_ids);
            }
        }
    }
}

fn apply_snapshot(view: &Weak<Mutex<BadgeView>>, generation: u64, profile_id: &str, snapshot: &UnreadMap) {
    let Some(view) = view.upgrade() else {
        return;
    };
    let mut view = view.lock();
    if view.generation != generation {
        return;
    }
    view.map = snapshot.clone();
    view.total = view.map.total();
    view.state = BadgeState::Active(profile_id.to_string());
}
