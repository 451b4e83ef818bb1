//! Subscription handles.

use super::manager::ListenerRegistry;
use crate::types::UnreadMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

/// Callback invoked with a fresh snapshot.
pub type ListenerFn = dyn Fn(&UnreadMap) + Send + Sync;

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Disposer for a registered listener.
///
/// Calling [`Subscription::unsubscribe`] more than once is harmless.
/// Dropping the handle also unsubscribes.
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    profile_id: String,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(registry: Weak<ListenerRegistry>, profile_id: &str, id: ListenerId) -> Self {
        Self {
            registry,
            profile_id: profile_id.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Whether the listener is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the listener.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.profile_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("profile_id", &self.profile_id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Channel-backed subscription.
pub struct SnapshotReceiver {
    pub subscription: Subscription,
    /// Channel to receive snapshots.
    pub receiver: crossbeam_channel::Receiver<UnreadMap>,
}

impl SnapshotReceiver {
    /// Receive the next snapshot (blocking).
    pub fn recv(&self) -> Result<UnreadMap, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a snapshot (non-blocking).
    pub fn try_recv(&self) -> Result<UnreadMap, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<UnreadMap, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered and return the newest snapshot.
    pub fn latest(&self) -> Option<UnreadMap> {
        self.receiver.try_iter().last()
    }
}
