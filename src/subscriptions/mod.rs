//! Listener registry for live unread-count updates.
//!
//! Every profile has its own listener set. Observers receive a full
//! snapshot of the profile's map after each mutation, and once right away
//! when they subscribe.
//!
//! Two kinds of listener are supported:
//! - Callbacks, invoked on the thread that performed the mutation
//! - Bounded channels, for consumers on other threads (dropped on overflow)
//!
//! Each snapshot carries the profile's revision; a listener never sees a
//! revision older than one it already received, even when mutations on
//! different threads race to deliver. Deliveries to one listener are
//! serialized, so a slow callback holds back newer snapshots for itself
//! only.
//!
//! # Example
//!
//! ```ignore
//! let store = UnreadStore::in_memory()?;
//!
//! let subscription = store.subscribe("profile-1", |map| {
//!     println!("badge: {}", map.total());
//! });
//!
//! store.increment("profile-1", "conversation-9", 1);
//! subscription.unsubscribe();
//! ```

mod manager;
mod types;

pub use manager::ListenerRegistry;
pub use types::{ListenerFn, ListenerId, SnapshotReceiver, Subscription};
