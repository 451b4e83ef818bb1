//! The unread count store.

use crate::error::Result;
use crate::storage::{KeyValueStorage, MemoryStorage};
use crate::subscriptions::{ListenerFn, ListenerRegistry, SnapshotReceiver, Subscription};
use crate::types::UnreadMap;
use crate::writer::{JobHandler, PersistWorker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Default storage key prefix; the profile id is appended.
pub const DEFAULT_KEY_PREFIX: &str = "puol:messages:unread:";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct UnreadStoreConfig {
    /// Prefix for per-profile storage keys.
    pub key_prefix: String,

    /// Collapse queued writes for the same profile into one.
    pub coalesce_writes: bool,
}

impl Default for UnreadStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            coalesce_writes: true,
        }
    }
}

/// A mutation, kept so it can be replayed on a freshly loaded map.
enum Edit {
    Track(Vec<String>),
    Step(String, i64),
    Zero(Vec<String>),
}

impl Edit {
    fn ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
        ids.iter().map(|id| id.as_ref().to_string()).collect()
    }

    /// Apply to `map`. Returns true if anything changed; a step always
    /// counts as a change.
    fn apply(&self, map: &mut UnreadMap) -> bool {
        match self {
            Edit::Track(ids) => ids.iter().fold(false, |added, id| map.track(id) | added),
            Edit::Step(id, step) => {
                map.apply_step(id, *step);
                true
            }
            Edit::Zero(ids) => ids.iter().fold(false, |changed, id| map.zero(id) | changed),
        }
    }
}

/// A hydration that has begun but not completed.
struct PendingHydration {
    /// The map was mutated before the hydration began. Its queued write
    /// replaces whatever is stored, so memory is kept instead of loaded.
    dirty: bool,
    /// Edits made since the hydration began, replayed on the loaded map.
    edits: Vec<Edit>,
}

#[derive(Default)]
struct ProfileState {
    map: UnreadMap,
    hydrated: bool,
    pending: Option<PendingHydration>,
    /// Bumped on every change; orders snapshots for listeners.
    revision: u64,
}

/// Outcome of a hydration attempt.
struct Hydration {
    snapshot: UnreadMap,
    /// Memory holds changes storage lacks; a write is due.
    stale_storage: bool,
}

/// State shared between the store and its persistence thread.
struct StoreCore {
    config: UnreadStoreConfig,
    storage: Arc<dyn KeyValueStorage>,
    profiles: Mutex<HashMap<String, ProfileState>>,
    listeners: Arc<ListenerRegistry>,
}

impl StoreCore {
    fn storage_key(&self, profile_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, profile_id)
    }

    fn revision_snapshot(&self, profile_id: &str) -> (u64, UnreadMap) {
        self.profiles
            .lock()
            .get(profile_id)
            .map(|state| (state.revision, state.map.clone()))
            .unwrap_or_default()
    }

    /// Read and parse the persisted map. Every failure degrades to empty.
    fn load(&self, profile_id: &str) -> UnreadMap {
        let key = self.storage_key(profile_id);
        match self.storage.get(&key) {
            Ok(Some(raw)) => match UnreadMap::decode(&key, &raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(profile_id, error = %e, "discarding malformed unread payload");
                    UnreadMap::new()
                }
            },
            Ok(None) => UnreadMap::new(),
            Err(e) => {
                tracing::warn!(profile_id, error = %e, "failed to load unread counts");
                UnreadMap::new()
            }
        }
    }

    /// Start recording edits for a profile about to be hydrated. Returns
    /// false if it already is.
    fn begin_hydration(&self, profile_id: &str) -> bool {
        let mut profiles = self.profiles.lock();
        let state = profiles.entry(profile_id.to_string()).or_default();
        if state.hydrated {
            return false;
        }
        let dirty = state.revision > 0;
        state.pending.get_or_insert_with(|| PendingHydration {
            dirty,
            edits: Vec::new(),
        });
        true
    }

    /// Load the persisted map once per profile and notify. Edits made
    /// since the hydration began are replayed on top of the loaded map.
    /// Later calls just return the current snapshot.
    fn initialize(&self, profile_id: &str) -> Hydration {
        if !self.begin_hydration(profile_id) {
            return Hydration {
                snapshot: self.revision_snapshot(profile_id).1,
                stale_storage: false,
            };
        }

        let dirty = self
            .profiles
            .lock()
            .get(profile_id)
            .and_then(|state| state.pending.as_ref())
            .is_some_and(|pending| pending.dirty);
        let loaded = if dirty { None } else { Some(self.load(profile_id)) };

        let (revision, hydration) = {
            let mut profiles = self.profiles.lock();
            let state = profiles.entry(profile_id.to_string()).or_default();
            if state.hydrated {
                // Another caller won the race.
                return Hydration {
                    snapshot: state.map.clone(),
                    stale_storage: false,
                };
            }
            let edits = state.pending.take().map(|p| p.edits).unwrap_or_default();
            if let Some(mut map) = loaded {
                for edit in &edits {
                    edit.apply(&mut map);
                }
                state.map = map;
            }
            state.hydrated = true;
            state.revision += 1;
            (
                state.revision,
                Hydration {
                    snapshot: state.map.clone(),
                    stale_storage: dirty || !edits.is_empty(),
                },
            )
        };

        tracing::debug!(
            profile_id,
            entries = hydration.snapshot.len(),
            kept_memory = dirty,
            stale_storage = hydration.stale_storage,
            "hydrated unread counts"
        );
        self.listeners.broadcast(profile_id, revision, &hydration.snapshot);
        hydration
    }
}

impl JobHandler for StoreCore {
    fn persist(&self, profile_id: &str) {
        let snapshot = {
            let profiles = self.profiles.lock();
            match profiles.get(profile_id) {
                // Deferred; the hydration writes once it completes.
                Some(state) if state.pending.is_some() => return,
                Some(state) => state.map.clone(),
                None => UnreadMap::new(),
            }
        };
        let key = self.storage_key(profile_id);
        let result = snapshot
            .encode()
            .and_then(|payload| self.storage.set(&key, &payload));
        if let Err(e) = result {
            tracing::warn!(profile_id, error = %e, "failed to persist unread counts");
        }
    }

    fn hydrate(&self, profile_id: &str) {
        if self.initialize(profile_id).stale_storage {
            self.persist(profile_id);
        }
    }
}

/// Per-profile unread counters with live subscriptions and best-effort
/// persistence.
///
/// Reads and mutations act on memory synchronously. Each mutation that
/// changes something notifies the profile's listeners, then queues a
/// background write of the profile's whole map. Storage failures are
/// logged and never returned.
///
/// Empty profile or conversation ids turn mutations into no-ops.
pub struct UnreadStore {
    core: Arc<StoreCore>,
    writer: PersistWorker,
}

impl UnreadStore {
    /// Create a store over the given storage backend.
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: UnreadStoreConfig) -> Result<Self> {
        let core = Arc::new(StoreCore {
            config,
            storage,
            profiles: Mutex::new(HashMap::new()),
            listeners: Arc::new(ListenerRegistry::new()),
        });
        let writer = PersistWorker::spawn(core.clone(), core.config.coalesce_writes)?;

        Ok(Self { core, writer })
    }

    /// Create a store backed by process memory only.
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryStorage::new()), UnreadStoreConfig::default())
    }

    pub fn config(&self) -> &UnreadStoreConfig {
        &self.core.config
    }

    /// Storage key holding a profile's map.
    pub fn storage_key(&self, profile_id: &str) -> String {
        self.core.storage_key(profile_id)
    }

    // --- Lifecycle ---

    /// Hydrate a profile from storage and return its snapshot.
    ///
    /// Only the first call per profile touches storage; it replaces the
    /// in-memory map with the loaded one (empty if missing, unreadable or
    /// malformed) and notifies listeners. This blocks on the storage read.
    /// Mutations racing with the read are re-applied to the loaded map. A
    /// profile mutated before hydration keeps its in-memory map, since the
    /// queued write of that map supersedes what is stored.
    pub fn initialize(&self, profile_id: &str) -> UnreadMap {
        if profile_id.is_empty() {
            return UnreadMap::new();
        }
        let hydration = self.core.initialize(profile_id);
        if hydration.stale_storage {
            self.writer.schedule_persist(profile_id);
        }
        hydration.snapshot
    }

    /// Queue [`UnreadStore::initialize`] on the persistence thread.
    ///
    /// Mutations made before the job runs are kept: they are replayed on
    /// top of the loaded map.
    pub fn initialize_in_background(&self, profile_id: &str) {
        if profile_id.is_empty() {
            return;
        }
        if self.core.begin_hydration(profile_id) {
            self.writer.schedule_hydrate(profile_id);
        }
    }

    /// Whether the profile has been hydrated from storage.
    pub fn is_initialized(&self, profile_id: &str) -> bool {
        self.core
            .profiles
            .lock()
            .get(profile_id)
            .is_some_and(|state| state.hydrated)
    }

    /// Block until all queued persistence work has completed.
    ///
    /// Must not be called from a listener: background hydration delivers
    /// snapshots on the persistence thread itself.
    pub fn flush(&self) {
        self.writer.flush();
    }

    // --- Subscriptions ---

    /// Register a listener and immediately call it with the current
    /// snapshot.
    pub fn subscribe<F>(&self, profile_id: &str, listener: F) -> Subscription
    where
        F: Fn(&UnreadMap) + Send + Sync + 'static,
    {
        let callback: Arc<ListenerFn> = Arc::new(listener);
        let subscription = self.core.listeners.add_callback(profile_id, callback);
        let (revision, snapshot) = self.core.revision_snapshot(profile_id);
        self.core
            .listeners
            .deliver_to(profile_id, subscription.id(), revision, &snapshot);
        subscription
    }

    /// Subscribe through a bounded channel. The current snapshot is queued
    /// first. The channel is dropped from the registry if it overflows.
    pub fn subscribe_channel(&self, profile_id: &str, buffer_size: usize) -> SnapshotReceiver {
        let receiver = self.core.listeners.add_channel(profile_id, buffer_size);
        let (revision, snapshot) = self.core.revision_snapshot(profile_id);
        self.core
            .listeners
            .deliver_to(profile_id, receiver.subscription.id(), revision, &snapshot);
        receiver
    }

    /// Number of listeners registered for a profile.
    pub fn listener_count(&self, profile_id: &str) -> usize {
        self.core.listeners.listener_count(profile_id)
    }

    // --- Mutations ---

    /// Give every listed conversation an explicit zero entry if it has
    /// none.
    pub fn ensure_tracked_keys<S: AsRef<str>>(&self, profile_id: &str, conversation_ids: &[S]) {
        if profile_id.is_empty() {
            return;
        }
        self.mutate(profile_id, Edit::Track(Edit::ids(conversation_ids)));
    }

    /// Add `step` (possibly negative) to a conversation's count, clamping
    /// at zero. Always notifies and persists, even when the count is
    /// unchanged.
    pub fn increment(&self, profile_id: &str, conversation_id: &str, step: i64) {
        if profile_id.is_empty() || conversation_id.is_empty() {
            return;
        }
        self.mutate(profile_id, Edit::Step(conversation_id.to_string(), step));
    }

    /// Zero a conversation's count.
    pub fn reset(&self, profile_id: &str, conversation_id: &str) {
        if profile_id.is_empty() || conversation_id.is_empty() {
            return;
        }
        self.mutate(profile_id, Edit::Zero(vec![conversation_id.to_string()]));
    }

    /// Zero several counts, notifying and persisting once at most.
    pub fn reset_bulk<S: AsRef<str>>(&self, profile_id: &str, conversation_ids: &[S]) {
        if profile_id.is_empty() {
            return;
        }
        self.mutate(profile_id, Edit::Zero(Edit::ids(conversation_ids)));
    }

    /// Apply an edit to the profile's map; if it changed something,
    /// notify and queue a write.
    fn mutate(&self, profile_id: &str, edit: Edit) {
        let (revision, snapshot) = {
            let mut profiles = self.core.profiles.lock();
            let state = profiles.entry(profile_id.to_string()).or_default();
            let changed = edit.apply(&mut state.map);
            if let Some(pending) = state.pending.as_mut() {
                // Replayed even if it was a no-op here; the loaded map may differ.
                pending.edits.push(edit);
            }
            if !changed {
                return;
            }
            state.revision += 1;
            (state.revision, state.map.clone())
        };

        self.core.listeners.broadcast(profile_id, revision, &snapshot);
        self.writer.schedule_persist(profile_id);
    }

    // --- Reads ---

    /// Copy of a profile's current map (empty if never seen).
    pub fn get_snapshot(&self, profile_id: &str) -> UnreadMap {
        self.core.revision_snapshot(profile_id).1
    }

    /// Sum of a profile's counts.
    pub fn total_unread(&self, profile_id: &str) -> u64 {
        self.core
            .profiles
            .lock()
            .get(profile_id)
            .map(|state| state.map.total())
            .unwrap_or(0)
    }

    /// Profiles with an in-memory map.
    pub fn profile_ids(&self) -> Vec<String> {
        self.core.profiles.lock().keys().cloned().collect()
    }
}
